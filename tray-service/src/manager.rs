// SPDX-License-Identifier: GPL-3.0-only

//! Facade over the mount and transfer supervisors
//!
//! Every operation reads a fresh snapshot of the configuration, so changes
//! made through [`RcloneManager::replace_config`] apply to the next launch
//! without touching anything already running.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use tray_sys::{
    ForceUnmount, FuseUnmount, MountTable, MountVerifier, ProcTable, ProcessDiscovery,
    ProcessLauncher, RCloneCli, RemoteLister, SpawnLauncher,
};
use tray_types::{MountInfo, RemoteInfo, RemoteUsage, TransferInfo, TransferKind};

use crate::config::{TrayConfig, is_valid_remote_name};
use crate::error::{MountError, Result, ServiceError};
use crate::mounts::{MountOptions, MountPolicy, MountSupervisor};
use crate::transfers::TransferSupervisor;

/// The OS and CLI seams the manager drives
pub struct Backends {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub verifier: Arc<dyn MountVerifier>,
    pub unmounter: Arc<dyn ForceUnmount>,
    pub discovery: Arc<dyn ProcessDiscovery>,
    pub remotes: Arc<dyn RemoteLister>,
}

impl Backends {
    /// Real processes, the real mount table and the given rclone CLI
    pub fn system(cli: RCloneCli) -> Self {
        Self {
            launcher: Arc::new(SpawnLauncher),
            verifier: Arc::new(MountTable::new()),
            unmounter: Arc::new(FuseUnmount),
            discovery: Arc::new(ProcTable),
            remotes: Arc::new(cli),
        }
    }
}

pub struct RcloneManager {
    config: RwLock<TrayConfig>,
    remotes: Arc<dyn RemoteLister>,
    mounts: MountSupervisor,
    transfers: TransferSupervisor,
}

impl RcloneManager {
    /// Locate rclone and wire up the system backends
    pub fn new(config: TrayConfig) -> Result<Self> {
        let cli = RCloneCli::new(&config.rclone_path, config.rclone_config.clone())?;
        let program = cli.binary_path().to_path_buf();
        Ok(Self::with_backends(config, program, Backends::system(cli)))
    }

    pub fn with_backends(config: TrayConfig, program: impl Into<PathBuf>, backends: Backends) -> Self {
        let program = program.into();
        let mounts = MountSupervisor::new(
            program.clone(),
            backends.launcher.clone(),
            backends.verifier,
            backends.unmounter,
            backends.discovery,
        );
        let transfers = TransferSupervisor::new(
            program,
            backends.launcher,
            config.supervision.transfer_history,
        );
        Self {
            config: RwLock::new(config),
            remotes: backends.remotes,
            mounts,
            transfers,
        }
    }

    pub fn config(&self) -> TrayConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in a new configuration for future launches
    pub fn replace_config(&self, config: TrayConfig) -> Result<()> {
        config.validate()?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
        info!("Configuration replaced");
        Ok(())
    }

    fn mount_options(&self, remote: &str) -> MountOptions {
        let config = self.config();
        MountOptions {
            mount_point: config.mount_point(remote),
            extra_args: config.mount_options_for(remote),
            network: config.network_options(),
            policy: MountPolicy::from(&config.supervision),
            rclone_config: config.rclone_config,
        }
    }

    // Remotes

    pub fn list_remotes(&self) -> Vec<String> {
        self.remotes.list_remotes()
    }

    /// Remotes with their backend type and whether they are mounted
    pub fn remote_details(&self) -> Vec<RemoteInfo> {
        let config = self.config();
        self.list_remotes()
            .into_iter()
            .map(|name| {
                let mount_point = config.mount_point(&name);
                RemoteInfo {
                    remote_type: self.remotes.remote_type(&name),
                    mounted: self.mounts.is_mounted(&name, &mount_point),
                    mount_point,
                    name,
                }
            })
            .collect()
    }

    pub fn remote_usage(&self, remote: &str) -> Result<RemoteUsage> {
        check_remote(remote)?;
        Ok(self.remotes.usage(remote)?)
    }

    // Mounts

    pub fn mount(&self, remote: &str) -> Result<MountInfo> {
        check_remote(remote)?;
        let options = self.mount_options(remote);
        Ok(self.mounts.mount(remote, &options)?)
    }

    /// `Ok(false)` when the remote was not mounted
    pub fn unmount(&self, remote: &str) -> Result<bool> {
        check_remote(remote)?;
        let config = self.config();
        Ok(self.mounts.unmount(
            remote,
            &config.mount_point(remote),
            config.supervision.terminate_grace(),
        )?)
    }

    pub fn is_mounted(&self, remote: &str) -> bool {
        if !is_valid_remote_name(remote) {
            return false;
        }
        let mount_point = self.config().mount_point(remote);
        self.mounts.is_mounted(remote, &mount_point)
    }

    pub fn cancel_mount(&self, remote: &str) -> bool {
        self.mounts.cancel(remote)
    }

    /// Rebuild mount state from the mount base directory
    pub fn refresh(&self) -> Vec<MountInfo> {
        let base_dir = self.config().mount.base_dir;
        self.mounts.refresh(&base_dir)
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.registry().snapshot()
    }

    /// Mounts that disappeared since the last check
    pub fn reconcile_mounts(&self) -> Vec<MountInfo> {
        self.mounts.reconcile()
    }

    /// Mount every listed remote if the configuration asks for it.
    /// Failures are logged and skipped.
    pub fn mount_on_startup(&self) -> Vec<MountInfo> {
        if !self.config().mount.mount_on_startup {
            return Vec::new();
        }

        let mut mounted = Vec::new();
        for remote in self.list_remotes() {
            match self.mount(&remote) {
                Ok(info) => mounted.push(info),
                Err(e) => warn!(remote = %remote, "Startup mount failed: {}", e),
            }
        }
        info!("Mounted {} remotes on startup", mounted.len());
        mounted
    }

    // Transfers

    pub fn sync(&self, source: &str, dest: &str, flags: &[String]) -> Result<TransferInfo> {
        self.start_transfer(TransferKind::Sync, source, dest, flags)
    }

    pub fn copy(&self, source: &str, dest: &str, flags: &[String]) -> Result<TransferInfo> {
        self.start_transfer(TransferKind::Copy, source, dest, flags)
    }

    pub fn start_transfer(
        &self,
        kind: TransferKind,
        source: &str,
        dest: &str,
        flags: &[String],
    ) -> Result<TransferInfo> {
        if source.trim().is_empty() || dest.trim().is_empty() {
            return Err(ServiceError::InvalidArgument(
                "source and destination are required".to_string(),
            ));
        }

        let config = self.config();
        // Local-only transfers work without an rclone.conf
        let rclone_config = config
            .rclone_config
            .exists()
            .then_some(config.rclone_config.as_path());

        Ok(self.transfers.start(
            kind,
            source,
            dest,
            flags,
            rclone_config,
            config.supervision.launch_timeout(),
        )?)
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.transfers.list()
    }

    pub fn transfer(&self, id: &str) -> Option<TransferInfo> {
        self.transfers.registry().get(id)
    }

    pub fn cancel_transfer(&self, id: &str) -> bool {
        let grace = self.config().supervision.terminate_grace();
        self.transfers.cancel(id, grace)
    }

    /// Returns how many running transfers were updated
    pub fn set_bandwidth_limit(&self, limit: &str) -> usize {
        self.transfers.set_bandwidth_limit(limit)
    }

    /// Drain transfer output; returns the jobs that just ended
    pub fn poll_transfers(&self) -> Vec<TransferInfo> {
        self.transfers.poll()
    }

    pub fn clear_finished_transfers(&self) -> usize {
        self.transfers.clear_finished()
    }

    /// Unmount everything and stop every transfer
    pub fn cleanup(&self) {
        let grace = self.config().supervision.terminate_grace();
        info!("Cleaning up mounts and transfers");
        self.transfers.cleanup(grace);
        self.mounts.cleanup(grace);
    }
}

fn check_remote(remote: &str) -> Result<()> {
    if is_valid_remote_name(remote) {
        Ok(())
    } else {
        Err(MountError::InvalidRemote(remote.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteMountSettings;
    use crate::testing::{
        FakeDiscovery, FakeLauncher, FakeMountTable, FakeRemotes, LaunchBehavior, TempDir,
    };
    use tray_types::TransferStatus;

    struct Fixture {
        _temp: TempDir,
        table: Arc<FakeMountTable>,
        launcher: Arc<FakeLauncher>,
        manager: RcloneManager,
    }

    fn fixture(configure: impl FnOnce(&mut TrayConfig)) -> Fixture {
        let temp = TempDir::new("manager");
        let mut config = TrayConfig::default();
        config.rclone_config = temp.rclone_config();
        config.mount.base_dir = temp.path.join("mnt");
        config.supervision.verify_attempts = 3;
        config.supervision.verify_interval_ms = 1;
        config.supervision.terminate_grace_ms = 10;
        configure(&mut config);

        let table = Arc::new(FakeMountTable::default());
        let launcher = Arc::new(FakeLauncher::new(
            Arc::clone(&table),
            LaunchBehavior::MountAfter(1),
        ));
        let backends = Backends {
            launcher: launcher.clone(),
            verifier: table.clone(),
            unmounter: table.clone(),
            discovery: Arc::new(FakeDiscovery::default()),
            remotes: Arc::new(FakeRemotes::new(&[("gdrive", "drive"), ("box", "box")])),
        };
        let manager = RcloneManager::with_backends(config, "/usr/bin/rclone", backends);
        Fixture {
            _temp: temp,
            table,
            launcher,
            manager,
        }
    }

    #[test]
    fn remote_details_track_mounts() {
        let f = fixture(|_| {});
        assert_eq!(f.manager.list_remotes(), vec!["gdrive", "box"]);

        f.manager.mount("gdrive").expect("mount");
        let details = f.manager.remote_details();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].name, "gdrive");
        assert_eq!(details[0].remote_type.as_deref(), Some("drive"));
        assert!(details[0].mounted);
        assert!(!details[1].mounted);
        assert_eq!(
            details[1].mount_point,
            f.manager.config().mount.base_dir.join("box")
        );
    }

    #[test]
    fn mount_uses_configured_options() {
        let f = fixture(|config| {
            config.mount.remotes.insert(
                "gdrive".to_string(),
                RemoteMountSettings {
                    options: "--read-only".to_string(),
                },
            );
            config.network.bandwidth_limit = "5".to_string();
        });

        let info = f.manager.mount("gdrive").expect("mount");
        let launches = f.launcher.launches();
        assert_eq!(launches[0].program, PathBuf::from("/usr/bin/rclone"));
        let args = &launches[0].args;
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--config".to_string()));
        let bwlimit = args
            .iter()
            .position(|arg| arg == "--bwlimit")
            .expect("bwlimit flag");
        assert_eq!(args[bwlimit + 1], "5M");
        assert_eq!(&info.launch_args, args);

        assert!(f.manager.is_mounted("gdrive"));
        assert!(f.manager.unmount("gdrive").expect("unmount"));
        assert!(!f.manager.is_mounted("gdrive"));
        assert!(!f.manager.unmount("gdrive").expect("second unmount"));
    }

    #[test]
    fn rejects_bad_remote_names() {
        let f = fixture(|_| {});
        assert!(matches!(
            f.manager.mount("../etc"),
            Err(ServiceError::Mount(MountError::InvalidRemote(_)))
        ));
        assert!(matches!(
            f.manager.mount("gdrive:"),
            Err(ServiceError::Mount(MountError::InvalidRemote(_)))
        ));
        assert!(!f.manager.is_mounted("a/b"));
        assert_eq!(f.launcher.launch_count(), 0);
    }

    #[test]
    fn usage_comes_from_the_lister() {
        let f = fixture(|_| {});
        let usage = f.manager.remote_usage("gdrive").expect("usage");
        assert_eq!(usage.free, Some(75));
        assert!(matches!(
            f.manager.remote_usage("missing"),
            Err(ServiceError::Sys(_))
        ));
    }

    #[test]
    fn startup_mounts_follow_config() {
        let f = fixture(|_| {});
        assert!(f.manager.mount_on_startup().is_empty());

        let f = fixture(|config| config.mount.mount_on_startup = true);
        let mounted = f.manager.mount_on_startup();
        assert_eq!(mounted.len(), 2);
        assert_eq!(f.manager.mounts().len(), 2);
    }

    #[test]
    fn transfers_need_both_ends() {
        let f = fixture(|_| {});
        assert!(matches!(
            f.manager.sync("", "/tmp", &[]),
            Err(ServiceError::InvalidArgument(_))
        ));

        let job = f.manager.copy("gdrive:a", "/tmp/a", &[]).expect("copy");
        assert_eq!(job.kind, TransferKind::Copy);
        assert_eq!(f.manager.transfer(&job.id).map(|j| j.id), Some(job.id.clone()));

        assert!(f.manager.cancel_transfer(&job.id));
        assert_eq!(f.manager.transfers()[0].status, TransferStatus::Cancelled);
        assert_eq!(f.manager.clear_finished_transfers(), 1);
        assert!(f.manager.transfers().is_empty());
    }

    #[test]
    fn cleanup_empties_everything() {
        let f = fixture(|_| {});
        f.manager.mount("gdrive").expect("mount");
        f.manager.mount("box").expect("mount");
        f.manager.sync("gdrive:", "/tmp/backup", &[]).expect("sync");
        f.manager.copy("box:", "/tmp/box", &[]).expect("copy");
        f.manager.poll_transfers();

        f.manager.cleanup();
        assert!(f.manager.mounts().is_empty());
        assert!(f.manager.transfers().is_empty());
        assert_eq!(f.launcher.running_count(), 0);
        assert_eq!(f.table.unmounts().len(), 2);
    }

    #[test]
    fn replaced_config_applies_to_next_mount() {
        let f = fixture(|_| {});
        let mut config = f.manager.config();
        config.mount.options = "--allow-other".to_string();
        f.manager.replace_config(config).expect("replace");

        f.manager.mount("box").expect("mount");
        assert!(f.launcher.launches()[0].args.contains(&"--allow-other".to_string()));

        let mut invalid = f.manager.config();
        invalid.supervision.verify_attempts = 0;
        assert!(f.manager.replace_config(invalid).is_err());
    }
}
