// SPDX-License-Identifier: GPL-3.0-only

//! In-memory stand-ins for the OS seams used by the supervisors

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tray_sys::{
    ForceUnmount, LaunchSpec, MountVerifier, ProcessDiscovery, ProcessHandle, ProcessLauncher,
    RemoteLister, SysError,
};
use tray_types::RemoteUsage;

static COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct TempDir {
    pub path: PathBuf,
}

impl TempDir {
    pub fn new(label: &str) -> Self {
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "rclone-tray-{label}-{}-{unique}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    /// Writes an empty rclone.conf and returns its path
    pub fn rclone_config(&self) -> PathBuf {
        let path = self.path.join("rclone.conf");
        std::fs::write(&path, "[gdrive]\ntype = drive\n").expect("write rclone.conf");
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// A mount table the fake launcher and the tests can both edit
#[derive(Debug, Default)]
pub struct FakeMountTable {
    mounted: Mutex<HashSet<PathBuf>>,
    /// Paths that become mounted after this many more checks
    pending: Mutex<HashMap<PathBuf, usize>>,
    checks: AtomicUsize,
    unmounts: Mutex<Vec<PathBuf>>,
    /// Listed but no longer answering, as after rclone crashes
    dead: Mutex<HashSet<PathBuf>>,
}

impl FakeMountTable {
    pub fn mount(&self, path: &Path) {
        self.mounted.lock().expect("lock").insert(path.to_path_buf());
    }

    pub fn mount_after(&self, path: &Path, checks: usize) {
        self.pending
            .lock()
            .expect("lock")
            .insert(path.to_path_buf(), checks);
    }

    pub fn remove(&self, path: &Path) {
        self.mounted.lock().expect("lock").remove(path);
    }

    pub fn mark_dead(&self, path: &Path) {
        self.dead.lock().expect("lock").insert(path.to_path_buf());
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.unmounts.lock().expect("lock").clone()
    }
}

impl MountVerifier for FakeMountTable {
    fn is_mounted(&self, path: &Path) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);

        let mut pending = self.pending.lock().expect("lock");
        if let Some(remaining) = pending.get_mut(path) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                pending.remove(path);
                self.mount(path);
            }
        }
        drop(pending);

        self.mounted.lock().expect("lock").contains(path)
    }

    fn is_responsive(&self, path: &Path) -> bool {
        !self.dead.lock().expect("lock").contains(path)
    }
}

impl ForceUnmount for FakeMountTable {
    fn force_unmount(&self, path: &Path) -> tray_sys::Result<()> {
        self.unmounts.lock().expect("lock").push(path.to_path_buf());
        self.pending.lock().expect("lock").remove(path);
        self.dead.lock().expect("lock").remove(path);
        self.remove(path);
        Ok(())
    }
}

/// Shared, inspectable state of one fake process
#[derive(Debug, Default)]
pub struct FakeProcessState {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub output: VecDeque<Vec<u8>>,
    pub stderr: String,
    pub inputs: Vec<String>,
    pub terminated: bool,
    pub killed: bool,
    pub refuse_signals: bool,
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<FakeProcessState>>,
}

impl FakeProcess {
    pub fn new(pid: u32, state: Arc<Mutex<FakeProcessState>>) -> Self {
        Self { pid, state }
    }

    fn stop(&self, code: i32) {
        let mut state = self.state.lock().expect("lock");
        if state.running {
            state.running = false;
            state.exit_code = Some(code);
        }
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_running(&mut self) -> bool {
        self.state.lock().expect("lock").running
    }

    fn read_output_chunk(&mut self) -> Vec<u8> {
        let mut state = self.state.lock().expect("lock");
        let mut output = Vec::new();
        while let Some(chunk) = state.output.pop_front() {
            output.extend(chunk);
        }
        output
    }

    fn error_output(&mut self) -> String {
        self.state.lock().expect("lock").stderr.clone()
    }

    fn write_input(&mut self, line: &str) -> tray_sys::Result<()> {
        let mut state = self.state.lock().expect("lock");
        if !state.running {
            return Err(SysError::OperationFailed("broken pipe".to_string()));
        }
        state.inputs.push(line.to_string());
        Ok(())
    }

    fn terminate(&mut self, _grace: Duration) -> tray_sys::Result<()> {
        {
            let mut state = self.state.lock().expect("lock");
            if state.refuse_signals && state.running {
                return Err(SysError::OperationFailed("EPERM".to_string()));
            }
            state.terminated = true;
        }
        self.stop(143);
        Ok(())
    }

    fn kill(&mut self) -> tray_sys::Result<()> {
        {
            let mut state = self.state.lock().expect("lock");
            if state.refuse_signals && state.running {
                return Err(SysError::OperationFailed("EPERM".to_string()));
            }
            state.killed = true;
        }
        self.stop(137);
        Ok(())
    }

    fn exit_status(&mut self) -> Option<i32> {
        let state = self.state.lock().expect("lock");
        if state.running { None } else { state.exit_code }
    }
}

/// What the next launched process does
#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    /// Stays running; the mount point appears after `checks` verifications
    MountAfter(usize),
    /// Stays running; the mount never appears
    NeverMount,
    /// Exits with `code` right away, optionally mounting first (daemon mode)
    Exit {
        code: i32,
        stderr: String,
        mount_after: Option<usize>,
    },
    /// Cannot be started
    FailToStart,
    /// Stays running until the test says otherwise
    Idle,
}

#[derive(Debug)]
pub struct FakeLauncher {
    table: Arc<FakeMountTable>,
    behavior: Mutex<LaunchBehavior>,
    launches: Mutex<Vec<LaunchSpec>>,
    processes: Mutex<Vec<Arc<Mutex<FakeProcessState>>>>,
    next_pid: AtomicU64,
}

impl FakeLauncher {
    pub fn new(table: Arc<FakeMountTable>, behavior: LaunchBehavior) -> Self {
        Self {
            table,
            behavior: Mutex::new(behavior),
            launches: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            next_pid: AtomicU64::new(40_000),
        }
    }

    pub fn set_behavior(&self, behavior: LaunchBehavior) {
        *self.behavior.lock().expect("lock") = behavior;
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().expect("lock").clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().expect("lock").len()
    }

    /// State of the `index`th launched process
    pub fn process(&self, index: usize) -> Arc<Mutex<FakeProcessState>> {
        Arc::clone(&self.processes.lock().expect("lock")[index])
    }

    pub fn running_count(&self) -> usize {
        self.processes
            .lock()
            .expect("lock")
            .iter()
            .filter(|state| state.lock().expect("lock").running)
            .count()
    }
}

fn mount_target(spec: &LaunchSpec) -> Option<PathBuf> {
    if spec.args.first().map(String::as_str) == Some("mount") {
        spec.args.get(2).map(PathBuf::from)
    } else {
        None
    }
}

impl ProcessLauncher for FakeLauncher {
    fn start(&self, spec: &LaunchSpec) -> tray_sys::Result<Box<dyn ProcessHandle>> {
        self.launches.lock().expect("lock").push(spec.clone());

        let behavior = self.behavior.lock().expect("lock").clone();
        let mut state = FakeProcessState {
            running: true,
            ..FakeProcessState::default()
        };

        let target = mount_target(spec);
        match behavior {
            LaunchBehavior::FailToStart => {
                return Err(SysError::LaunchFailed(format!(
                    "{}: No such file or directory",
                    spec.program.display()
                )));
            }
            LaunchBehavior::MountAfter(checks) => {
                if let Some(target) = &target {
                    self.table.mount_after(target, checks);
                }
            }
            LaunchBehavior::NeverMount | LaunchBehavior::Idle => {}
            LaunchBehavior::Exit {
                code,
                stderr,
                mount_after,
            } => {
                state.running = false;
                state.exit_code = Some(code);
                state.stderr = stderr;
                if let (Some(target), Some(checks)) = (&target, mount_after) {
                    self.table.mount_after(target, checks);
                }
            }
        }

        let state = Arc::new(Mutex::new(state));
        self.processes.lock().expect("lock").push(Arc::clone(&state));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(Box::new(FakeProcess::new(pid, state)))
    }
}

#[derive(Debug, Default)]
pub struct FakeDiscovery {
    pub owners: Mutex<HashMap<String, u32>>,
    pub lookups: AtomicUsize,
}

impl ProcessDiscovery for FakeDiscovery {
    fn find_mount_owner(&self, remote: &str) -> Option<u32> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.owners.lock().expect("lock").get(remote).copied()
    }

    fn fuse_helper_running(&self, _mount_point: &Path) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct FakeRemotes {
    pub remotes: Vec<(String, String)>,
}

impl FakeRemotes {
    pub fn new(remotes: &[(&str, &str)]) -> Self {
        Self {
            remotes: remotes
                .iter()
                .map(|(name, kind)| (name.to_string(), kind.to_string()))
                .collect(),
        }
    }
}

impl RemoteLister for FakeRemotes {
    fn list_remotes(&self) -> Vec<String> {
        self.remotes.iter().map(|(name, _)| name.clone()).collect()
    }

    fn remote_type(&self, remote: &str) -> Option<String> {
        self.remotes
            .iter()
            .find(|(name, _)| name == remote)
            .map(|(_, kind)| kind.clone())
    }

    fn usage(&self, remote: &str) -> tray_sys::Result<RemoteUsage> {
        if self.remotes.iter().any(|(name, _)| name == remote) {
            Ok(RemoteUsage {
                total: Some(100),
                used: Some(25),
                free: Some(75),
                ..RemoteUsage::default()
            })
        } else {
            Err(SysError::OperationFailed(format!("unknown remote {remote}")))
        }
    }
}
