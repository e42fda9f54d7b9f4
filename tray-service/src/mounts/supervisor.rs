// SPDX-License-Identifier: GPL-3.0-only

//! Mount lifecycle: launch, verify, register, tear down

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use tray_sys::{
    DiscoveredProcess, ForceUnmount, LaunchSpec, MountArgs, MountVerifier, NetworkOptions,
    ProcessDiscovery, ProcessHandle, ProcessLauncher,
};
use tray_types::{MountInfo, MountState};

use super::registry::{MountAttempt, MountEntry, MountRegistry};
use crate::config::SupervisionSettings;
use crate::error::MountError;

/// Longest single sleep while waiting, so cancellation is noticed quickly
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Timing of one mount attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPolicy {
    pub verify_attempts: u32,
    pub verify_interval: Duration,
    pub launch_timeout: Duration,
    pub terminate_grace: Duration,
}

impl Default for MountPolicy {
    fn default() -> Self {
        Self::from(&SupervisionSettings::default())
    }
}

impl From<&SupervisionSettings> for MountPolicy {
    fn from(settings: &SupervisionSettings) -> Self {
        Self {
            verify_attempts: settings.verify_attempts.max(1),
            verify_interval: settings.verify_interval(),
            launch_timeout: settings.launch_timeout(),
            terminate_grace: settings.terminate_grace(),
        }
    }
}

/// Configuration snapshot for a single mount launch
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub mount_point: PathBuf,
    pub rclone_config: PathBuf,
    /// Base and per-remote flags, already split
    pub extra_args: Vec<String>,
    pub network: NetworkOptions,
    pub policy: MountPolicy,
}

pub struct MountSupervisor {
    program: PathBuf,
    registry: MountRegistry,
    launcher: Arc<dyn ProcessLauncher>,
    verifier: Arc<dyn MountVerifier>,
    unmounter: Arc<dyn ForceUnmount>,
    discovery: Arc<dyn ProcessDiscovery>,
}

enum Outcome {
    Mounted { daemonized: bool },
    Exited(String),
    TimedOut,
    Cancelled,
}

impl MountSupervisor {
    pub fn new(
        program: impl Into<PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
        verifier: Arc<dyn MountVerifier>,
        unmounter: Arc<dyn ForceUnmount>,
        discovery: Arc<dyn ProcessDiscovery>,
    ) -> Self {
        Self {
            program: program.into(),
            registry: MountRegistry::new(),
            launcher,
            verifier,
            unmounter,
            discovery,
        }
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    /// Bring `remote` up at `options.mount_point`
    ///
    /// Returns the existing entry when the mount point is already live,
    /// whether we launched it or not.
    pub fn mount(&self, remote: &str, options: &MountOptions) -> Result<MountInfo, MountError> {
        let mount_point = options.mount_point.as_path();
        let attempt = self
            .registry
            .begin(remote, mount_point)
            .ok_or_else(|| MountError::InProgress(remote.to_string()))?;

        if let Some(existing) = self.live_entry(remote, mount_point) {
            debug!(remote = %remote, "Already mounted at {}", mount_point.display());
            return Ok(existing);
        }

        if !options.rclone_config.exists() {
            return Err(MountError::ConfigMissing(options.rclone_config.clone()));
        }

        std::fs::create_dir_all(mount_point)?;

        let args = MountArgs::new(remote, mount_point)
            .config(&options.rclone_config)
            .options(options.extra_args.iter().cloned())
            .network(options.network.clone())
            .build();
        let spec = LaunchSpec::new(&self.program, args.clone())
            .with_timeout(options.policy.launch_timeout);

        info!(remote = %remote, "Starting {}", spec.render());
        let mut process = self
            .launcher
            .start(&spec)
            .map_err(|e| MountError::LaunchFailure {
                remote: remote.to_string(),
                output: e.to_string(),
            })?;

        attempt.set_state(MountState::Verifying);
        match self.verify(&attempt, process.as_mut(), mount_point, &options.policy) {
            Outcome::Mounted { daemonized } => {
                let mut entry = MountEntry::launched(remote, mount_point, args, process);
                if daemonized {
                    self.attach_daemon(&mut entry);
                }
                let (info, previous) = self.registry.insert(entry);
                if previous.is_some() {
                    debug!(remote = %remote, "Replaced stale registry entry");
                }
                info!(remote = %remote, "Mounted at {}", mount_point.display());
                Ok(info)
            }
            Outcome::Exited(output) => {
                warn!(remote = %remote, "Mount process exited: {}", output.trim());
                Err(MountError::LaunchFailure {
                    remote: remote.to_string(),
                    output,
                })
            }
            Outcome::TimedOut => {
                let output = self.abandon(remote, process.as_mut(), mount_point);
                warn!(
                    remote = %remote,
                    attempts = options.policy.verify_attempts,
                    "Mount never became visible"
                );
                Err(MountError::VerificationTimeout {
                    remote: remote.to_string(),
                    attempts: options.policy.verify_attempts,
                    output,
                })
            }
            Outcome::Cancelled => {
                self.abandon(remote, process.as_mut(), mount_point);
                info!(remote = %remote, "Mount cancelled");
                Err(MountError::Cancelled(remote.to_string()))
            }
        }
    }

    /// Poll until the mount shows up, the process dies, retries run out or
    /// the attempt is cancelled. No registry lock is held in here.
    fn verify(
        &self,
        attempt: &MountAttempt<'_>,
        process: &mut dyn ProcessHandle,
        mount_point: &Path,
        policy: &MountPolicy,
    ) -> Outcome {
        let remote = attempt.remote();
        let mut daemonized = false;

        for number in 1..=policy.verify_attempts {
            if !sleep_unless_cancelled(attempt, policy.verify_interval) {
                return Outcome::Cancelled;
            }
            debug!(
                remote = %remote,
                attempt = number,
                "Checking mount {}/{}",
                number,
                policy.verify_attempts
            );

            log_output(remote, process);

            if !daemonized && !process.is_running() {
                match process.exit_status() {
                    Some(0) => {
                        debug!(remote = %remote, "Launcher exited cleanly, rclone is daemonized");
                        daemonized = true;
                    }
                    code => {
                        let mut output = process.error_output();
                        if output.trim().is_empty() {
                            output = format!("exited with status {code:?}");
                        }
                        return Outcome::Exited(output);
                    }
                }
            }

            if self.verifier.is_mounted(mount_point) {
                debug!(remote = %remote, attempt = number, "Mount verified");
                return Outcome::Mounted { daemonized };
            }

            if self.discovery.fuse_helper_running(mount_point) {
                debug!(remote = %remote, "fusermount helper running, still waiting");
            }
        }

        Outcome::TimedOut
    }

    /// Kill the launched process and clear whatever it may have mounted.
    /// Returns the captured error output.
    fn abandon(&self, remote: &str, process: &mut dyn ProcessHandle, mount_point: &Path) -> String {
        if let Err(e) = process.kill() {
            warn!(remote = %remote, "Failed to kill mount process: {}", e);
        }
        if let Err(e) = self.unmounter.force_unmount(mount_point) {
            debug!(remote = %remote, "Forced unmount after failed mount: {}", e);
        }
        process.error_output()
    }

    /// In daemon mode the launcher is gone; hand the entry the daemon instead
    fn attach_daemon(&self, entry: &mut MountEntry) {
        let Some(pid) = self.discovery.find_mount_owner(&entry.remote) else {
            debug!(remote = %entry.remote, "No rclone mount process found after daemonizing");
            return;
        };
        debug!(remote = %entry.remote, pid, "rclone mount daemon found");
        entry.owner_hint = Some(pid);
        entry.process = Some(Box::new(DiscoveredProcess::attach(
            pid,
            format!("{}:", entry.remote),
        )));
    }

    /// Live entry for `remote`, adopting a mount we did not start. Stale
    /// entries are dropped.
    fn live_entry(&self, remote: &str, mount_point: &Path) -> Option<MountInfo> {
        if !self.verifier.is_mounted(mount_point) {
            self.drop_stale(remote);
            return None;
        }
        if !self.verifier.is_responsive(mount_point) {
            self.clear_dead_mount(remote, mount_point);
            return None;
        }

        if let Some(info) = self.registry.get(remote) {
            return Some(info);
        }

        let mut entry = MountEntry::external(remote, mount_point);
        if let Some(pid) = self.discovery.find_mount_owner(remote) {
            entry.owner_hint = Some(pid);
            entry.process = Some(Box::new(DiscoveredProcess::attach(pid, format!("{remote}:"))));
        }
        info!(remote = %remote, "Adopting existing mount at {}", mount_point.display());
        Some(self.registry.insert(entry).0)
    }

    /// Drop a registry entry whose mount is gone or no longer answers,
    /// taking its process and any leftover mount with it
    fn drop_stale(&self, remote: &str) -> Option<MountInfo> {
        let mut entry = self.registry.take(remote)?;
        warn!(remote = %remote, "Mount at {} disappeared", entry.mount_point.display());
        entry.state = MountState::Failed("mount point is no longer mounted".to_string());
        if let Some(process) = entry.process.as_mut()
            && let Err(e) = process.kill()
        {
            warn!(remote = %remote, "Failed to stop orphaned mount process: {}", e);
        }
        if let Err(e) = self.unmounter.force_unmount(&entry.mount_point) {
            warn!(remote = %remote, "Failed to clear stale mount: {}", e);
        }
        Some(entry.info())
    }

    /// Listed in the mount table but dead, typically after rclone crashed
    fn clear_dead_mount(&self, remote: &str, mount_point: &Path) {
        warn!(remote = %remote, "Mount at {} is not responding", mount_point.display());
        let cleared = self
            .drop_stale(remote)
            .is_some_and(|info| info.mount_point == mount_point);
        if !cleared && let Err(e) = self.unmounter.force_unmount(mount_point) {
            warn!(remote = %remote, "Failed to clear dead mount: {}", e);
        }
    }

    /// OS-level check, reconciling the registry with what it finds
    pub fn is_mounted(&self, remote: &str, mount_point: &Path) -> bool {
        let path = self
            .registry
            .get(remote)
            .map(|info| info.mount_point)
            .unwrap_or_else(|| mount_point.to_path_buf());

        if self.verifier.is_mounted(&path) {
            true
        } else {
            self.drop_stale(remote);
            false
        }
    }

    /// Entries whose mount vanished or stopped answering, now marked failed
    /// and removed
    pub fn reconcile(&self) -> Vec<MountInfo> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|info| info.state.is_active())
            .filter(|info| {
                !self.verifier.is_mounted(&info.mount_point)
                    || !self.verifier.is_responsive(&info.mount_point)
            })
            .filter_map(|info| self.drop_stale(&info.remote))
            .collect()
    }

    /// Stop `remote`. `Ok(false)` when it was not mounted.
    ///
    /// Every step runs even if an earlier one failed: terminate the owning
    /// process, force the unmount, drop the entry.
    pub fn unmount(
        &self,
        remote: &str,
        mount_point: &Path,
        grace: Duration,
    ) -> Result<bool, MountError> {
        let path = self
            .registry
            .get(remote)
            .map(|info| info.mount_point)
            .unwrap_or_else(|| mount_point.to_path_buf());

        if !self.verifier.is_mounted(&path) {
            self.drop_stale(remote);
            return Ok(false);
        }

        info!(remote = %remote, "Unmounting {}", path.display());
        self.registry.set_state(remote, MountState::Stopping);
        let entry = self.registry.take(remote);

        let mut failure = None;
        if let Some(mut entry) = entry
            && let Some(process) = entry.process.as_mut()
            && let Err(e) = process.terminate(grace)
        {
            warn!(remote = %remote, "Failed to stop mount process: {}", e);
            failure = Some(e.to_string());
        }

        if let Err(e) = self.unmounter.force_unmount(&path) {
            warn!(remote = %remote, "Forced unmount failed: {}", e);
        }

        match failure {
            Some(detail) => Err(MountError::TeardownPartialFailure {
                remote: remote.to_string(),
                detail,
            }),
            None => {
                info!(remote = %remote, "Unmounted");
                Ok(true)
            }
        }
    }

    /// Cancel an in-flight mount of `remote`
    pub fn cancel(&self, remote: &str) -> bool {
        self.registry.cancel(remote)
    }

    /// Rebuild the registry from the mount points under `base_dir`
    pub fn refresh(&self, base_dir: &Path) -> Vec<MountInfo> {
        let mut previous: Vec<MountEntry> = self.registry.drain();
        let mut rebuilt = Vec::new();

        match std::fs::read_dir(base_dir) {
            Ok(dir_entries) => {
                for dir_entry in dir_entries.flatten() {
                    let mount_point = dir_entry.path();
                    let Some(remote) = dir_entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if !self.verifier.is_mounted(&mount_point) {
                        continue;
                    }

                    let entry = match previous.iter().position(|entry| entry.remote == remote) {
                        Some(index) => {
                            let mut entry = previous.swap_remove(index);
                            entry.mount_point = mount_point;
                            entry.state = MountState::Active;
                            entry
                        }
                        None => {
                            let mut entry = MountEntry::external(&remote, &mount_point);
                            if let Some(pid) = self.discovery.find_mount_owner(&remote) {
                                entry.owner_hint = Some(pid);
                                entry.process = Some(Box::new(DiscoveredProcess::attach(
                                    pid,
                                    format!("{remote}:"),
                                )));
                            }
                            entry
                        }
                    };
                    rebuilt.push(entry);
                }
            }
            Err(e) => {
                debug!("Cannot scan {}: {}", base_dir.display(), e);
            }
        }

        for stale in &mut previous {
            if let Some(process) = stale.process.as_mut()
                && process.is_running()
            {
                debug!(remote = %stale.remote, "Stopping process of vanished mount");
                if let Err(e) = process.kill() {
                    warn!(remote = %stale.remote, "Failed to stop orphaned mount process: {}", e);
                }
            }
        }

        info!("Found {} active mounts under {}", rebuilt.len(), base_dir.display());
        self.registry.replace_all(rebuilt);
        self.registry.snapshot()
    }

    /// Stop every in-flight attempt and unmount every tracked remote
    pub fn cleanup(&self, grace: Duration) {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} mount attempts", cancelled);
        }

        // Attempts clean up after themselves once they see the token
        let deadline = Instant::now() + grace;
        while self.registry.in_flight_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        for remote in self.registry.remotes() {
            let Some(info) = self.registry.get(&remote) else {
                continue;
            };
            match self.unmount(&remote, &info.mount_point, grace) {
                Ok(_) => {}
                Err(e) => warn!(remote = %remote, "Cleanup: {}", e),
            }
        }

        // Anything whose mount point was already gone
        for mut entry in self.registry.drain() {
            if let Some(process) = entry.process.as_mut()
                && let Err(e) = process.terminate(grace)
            {
                warn!(remote = %entry.remote, "Failed to stop mount process during cleanup: {}", e);
            }
        }
    }
}

/// Sleep for `total` in slices; false if the attempt was cancelled
fn sleep_unless_cancelled(attempt: &MountAttempt<'_>, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if attempt.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn log_output(remote: &str, process: &mut dyn ProcessHandle) {
    let chunk = process.read_output_chunk();
    if chunk.is_empty() {
        return;
    }
    for line in String::from_utf8_lossy(&chunk).lines() {
        debug!(remote = %remote, "rclone: {}", line);
    }
}
