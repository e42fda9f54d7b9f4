// SPDX-License-Identifier: GPL-3.0-only

//! Handles over spawned (or discovered) OS processes
//!
//! `ChildProcess` owns a child we spawned: stdout is pumped into a channel
//! by a reader thread so callers can pull chunks without blocking, and the
//! tail of stderr is kept for error reporting. `DiscoveredProcess` wraps a
//! pid we found in the process table and can only be signalled.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Result, SysError};
use crate::process_finder::process_cmdline;

const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 4096;
const WAIT_STEP: Duration = Duration::from_millis(50);
const EOF_WAIT: Duration = Duration::from_millis(100);

/// A process the supervisor can observe and stop
pub trait ProcessHandle: Send + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Live OS state, not a cached flag
    fn is_running(&mut self) -> bool;

    /// Whatever stdout produced since the last call. Empty when nothing is
    /// available; never blocks on a running process.
    fn read_output_chunk(&mut self) -> Vec<u8>;

    /// Captured stderr so far (tail only)
    fn error_output(&mut self) -> String;

    /// Write one control line to the process's stdin
    fn write_input(&mut self, line: &str) -> Result<()>;

    /// SIGTERM, wait up to `grace`, then SIGKILL. The process is reaped
    /// before this returns.
    fn terminate(&mut self, grace: Duration) -> Result<()>;

    fn kill(&mut self) -> Result<()>;

    /// Exit code once the process has fully exited. Signal deaths report
    /// `128 + signal`.
    fn exit_status(&mut self) -> Option<i32>;
}

/// Starts processes. The seam the supervisors are tested through.
pub trait ProcessLauncher: Send + Sync {
    fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// How long the spawn itself may take
    pub timeout: Duration,
    /// Pipe stdin so `write_input` works
    pub stdin: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(5),
            stdin: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.program.display().to_string()
        } else {
            format!("{} {}", self.program.display(), self.args.join(" "))
        }
    }
}

/// Launcher backed by `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnLauncher;

impl ProcessLauncher for SpawnLauncher {
    fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        Ok(Box::new(ChildProcess::spawn(spec)?))
    }
}

pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Receiver<Vec<u8>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    /// Spawn `spec`, giving up after `spec.timeout`
    ///
    /// The spawn runs on a helper thread. If it completes after we stopped
    /// waiting, that thread kills and reaps the late child.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let rendered = spec.render();
        debug!("Spawning {}", rendered);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("process-spawn".to_string())
            .spawn(move || {
                let result = command.spawn();
                if let Err(mpsc::SendError(Ok(mut child))) = tx.send(result) {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            })?;

        let mut child = match rx.recv_timeout(spec.timeout) {
            Ok(Ok(child)) => child,
            Ok(Err(e)) => return Err(SysError::LaunchFailed(format!("{rendered}: {e}"))),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(SysError::LaunchTimeout(spec.timeout));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(SysError::LaunchFailed(format!(
                    "{rendered}: spawn thread exited"
                )));
            }
        };

        let stdout = match child.stdout.take() {
            Some(stream) => pump_chunks(stream),
            None => closed_channel(),
        };
        let stderr = Arc::new(Mutex::new(Vec::new()));
        if let Some(stream) = child.stderr.take() {
            capture_tail(stream, Arc::clone(&stderr));
        }

        Ok(Self {
            stdin: child.stdin.take(),
            child,
            stdout,
            stderr,
            status: None,
        })
    }

    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(e) => warn!("Failed to poll pid {}: {}", self.child.id(), e),
            }
        }
        self.status
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_running(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    fn read_output_chunk(&mut self) -> Vec<u8> {
        let mut output = Vec::new();
        while let Ok(chunk) = self.stdout.try_recv() {
            output.extend(chunk);
        }

        // Once the process is gone the reader thread is about to hit EOF;
        // give it a moment so the last stats line is not lost.
        if self.poll_exit().is_some() {
            while let Ok(chunk) = self.stdout.recv_timeout(EOF_WAIT) {
                output.extend(chunk);
            }
        }

        output
    }

    fn error_output(&mut self) -> String {
        match self.stderr.lock() {
            Ok(buffer) => String::from_utf8_lossy(&buffer).into_owned(),
            Err(_) => String::new(),
        }
    }

    fn write_input(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            SysError::OperationFailed(format!("stdin of pid {} is not piped", self.child.id()))
        })?;
        stdin.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            stdin.write_all(b"\n")?;
        }
        stdin.flush()?;
        Ok(())
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let pid = self.child.id();
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => warn!("SIGTERM to pid {} failed: {}", pid, e),
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                debug!("pid {} exited after SIGTERM", pid);
                return Ok(());
            }
            thread::sleep(WAIT_STEP);
        }

        debug!("pid {} still running after {:?}, killing", pid, grace);
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        if self.poll_exit().is_some() {
            return Ok(());
        }

        match self.child.kill() {
            Ok(()) => {}
            // Already exited between the poll and the signal
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }

        self.status = Some(self.child.wait()?);
        Ok(())
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.poll_exit().map(exit_code)
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.child.id())
            .field("status", &self.status)
            .finish()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("Killing pid {} on drop", self.child.id());
            if let Err(e) = self.kill() {
                warn!("Failed to kill pid {} on drop: {}", self.child.id(), e);
            }
        }
    }
}

/// A process found in the process table rather than spawned by us
///
/// The pid is only trusted while its command line still contains `marker`,
/// so a recycled pid is never signalled.
#[derive(Debug)]
pub struct DiscoveredProcess {
    pid: u32,
    marker: String,
    gone: bool,
}

impl DiscoveredProcess {
    pub fn attach(pid: u32, marker: impl Into<String>) -> Self {
        Self {
            pid,
            marker: marker.into(),
            gone: false,
        }
    }

    fn still_ours(&self) -> bool {
        process_cmdline(self.pid)
            .map(|cmdline| cmdline.join(" ").contains(&self.marker))
            .unwrap_or(false)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(SysError::OperationFailed(format!(
                "{} to pid {} failed: {}",
                signal, self.pid, e
            ))),
        }
    }
}

impl ProcessHandle for DiscoveredProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_running(&mut self) -> bool {
        if self.gone {
            return false;
        }
        let alive = self.still_ours();
        if !alive {
            self.gone = true;
        }
        alive
    }

    fn read_output_chunk(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn error_output(&mut self) -> String {
        String::new()
    }

    fn write_input(&mut self, _line: &str) -> Result<()> {
        Err(SysError::OperationFailed(format!(
            "pid {} was not started by us; stdin is not available",
            self.pid
        )))
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        self.signal(Signal::SIGTERM)?;

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Ok(());
            }
            thread::sleep(WAIT_STEP);
        }

        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        if self.is_running() {
            self.signal(Signal::SIGKILL)?;
        }
        self.gone = true;
        Ok(())
    }

    fn exit_status(&mut self) -> Option<i32> {
        None
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn pump_chunks<R: Read + Send + 'static>(mut stream: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

fn capture_tail<R: Read + Send + 'static>(mut stream: R, sink: Arc<Mutex<Vec<u8>>>) {
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let Ok(mut captured) = sink.lock() else {
                        break;
                    };
                    captured.extend_from_slice(&buffer[..n]);
                    if captured.len() > STDERR_CAPTURE_LIMIT {
                        let excess = captured.len() - STDERR_CAPTURE_LIMIT;
                        captured.drain(..excess);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn closed_channel() -> Receiver<Vec<u8>> {
    let (_tx, rx) = mpsc::channel();
    rx
}
