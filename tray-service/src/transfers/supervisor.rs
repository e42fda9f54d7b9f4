// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tray_sys::{LaunchSpec, ProcessLauncher, is_unlimited, normalize_rate, transfer_args};
use tray_types::{TransferInfo, TransferKind};

use super::registry::{TransferJob, TransferRegistry};
use crate::error::TransferError;

/// Starts, polls and stops `rclone sync` / `rclone copy` jobs
pub struct TransferSupervisor {
    program: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    registry: TransferRegistry,
}

impl TransferSupervisor {
    pub fn new(
        program: impl Into<PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
        history_limit: usize,
    ) -> Self {
        Self {
            program: program.into(),
            launcher,
            registry: TransferRegistry::new(history_limit),
        }
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    pub fn start(
        &self,
        kind: TransferKind,
        source: &str,
        dest: &str,
        flags: &[String],
        rclone_config: Option<&Path>,
        launch_timeout: Duration,
    ) -> Result<TransferInfo, TransferError> {
        let id = self.registry.reserve_id(kind, source, dest);
        let args = transfer_args(kind, source, dest, rclone_config, flags);
        let spec = LaunchSpec::new(&self.program, args)
            .with_stdin()
            .with_timeout(launch_timeout);

        info!(job = %id, "Starting {}", spec.render());
        let process = self.launcher.start(&spec).map_err(|e| {
            warn!(job = %id, "Transfer failed to start: {}", e);
            TransferError::LaunchFailure(e.to_string())
        })?;

        let info = TransferInfo::new(id, kind, source.to_string(), dest.to_string());
        Ok(self.registry.insert(TransferJob::new(info, process)))
    }

    /// Pull output from every live job; returns the jobs that just ended
    pub fn poll(&self) -> Vec<TransferInfo> {
        let finished = self.registry.poll();
        for job in &finished {
            info!(
                job = %job.id,
                status = %job.status,
                exit_code = ?job.exit_code,
                "Transfer ended"
            );
        }
        finished
    }

    pub fn list(&self) -> Vec<TransferInfo> {
        self.registry.list()
    }

    /// Stop the job and mark it cancelled, even if it had already ended.
    /// False for an unknown id.
    pub fn cancel(&self, id: &str, grace: Duration) -> bool {
        let Some(process) = self.registry.take_process(id) else {
            return false;
        };

        if let Some(mut process) = process
            && let Err(e) = process.terminate(grace)
        {
            warn!(job = %id, "Failed to stop transfer: {}", e);
        }

        self.registry.mark_cancelled(id);
        info!(job = %id, "Transfer cancelled");
        true
    }

    /// Push a new rate to every running job. Returns how many were told.
    pub fn set_bandwidth_limit(&self, limit: &str) -> usize {
        let rate = if is_unlimited(limit) {
            "off".to_string()
        } else {
            normalize_rate(limit)
        };
        let delivered = self.registry.broadcast_running(&format!("bwlimit {rate}"));
        info!("Bandwidth limit {} sent to {} transfers", rate, delivered);
        delivered
    }

    pub fn clear_finished(&self) -> usize {
        self.registry.clear_finished()
    }

    /// Stop every job and forget all of them
    pub fn cleanup(&self, grace: Duration) {
        for mut job in self.registry.drain() {
            if let Some(process) = job.process.as_mut()
                && let Err(e) = process.terminate(grace)
            {
                warn!(job = %job.info.id, "Failed to stop transfer during cleanup: {}", e);
            }
        }
    }
}
