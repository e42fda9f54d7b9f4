// SPDX-License-Identifier: GPL-3.0-only

//! `org.rclonetray.Manager` on the session bus
//!
//! Structured results travel as JSON strings. Manager calls block on
//! subprocesses and sleeps, so each one runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use tracing::{debug, error, info};
use tray_types::MountState;
use zbus::object_server::SignalEmitter;
use zbus::{Connection, interface};

use crate::error::Result;
use crate::manager::RcloneManager;

pub const BUS_NAME: &str = "org.rclonetray.Manager";
pub const OBJECT_PATH: &str = "/org/rclonetray/Manager";

/// Mount reconciliation runs once every this many transfer polls
const RECONCILE_EVERY: u32 = 10;

pub struct TrayService {
    manager: Arc<RcloneManager>,
}

impl TrayService {
    pub fn new(manager: Arc<RcloneManager>) -> Self {
        Self { manager }
    }

    async fn run<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RcloneManager) -> Result<T> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.manager), call).await
    }
}

async fn run_blocking<T, F>(manager: Arc<RcloneManager>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&RcloneManager) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&manager)).await?
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

#[interface(name = "org.rclonetray.Manager")]
impl TrayService {
    /// Emitted when a mount is created, removed or found gone
    #[zbus(signal)]
    pub async fn mount_changed(
        emitter: &SignalEmitter<'_>,
        remote: &str,
        state: &str,
    ) -> zbus::Result<()>;

    /// Emitted once per transfer when it reaches a terminal status
    #[zbus(signal)]
    pub async fn transfer_finished(
        emitter: &SignalEmitter<'_>,
        id: &str,
        status: &str,
    ) -> zbus::Result<()>;

    /// JSON array of `RemoteInfo`
    async fn list_remotes(&self) -> zbus::fdo::Result<String> {
        let remotes = self.run(|manager| Ok(manager.remote_details())).await?;
        Ok(to_json(&remotes)?)
    }

    /// JSON `RemoteUsage`
    async fn remote_usage(&self, remote: String) -> zbus::fdo::Result<String> {
        let usage = self.run(move |manager| manager.remote_usage(&remote)).await?;
        Ok(to_json(&usage)?)
    }

    /// Mount and return the JSON `MountInfo`; already mounted is success
    async fn mount(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        remote: String,
    ) -> zbus::fdo::Result<String> {
        info!(remote = %remote, "D-Bus mount request");
        let name = remote.clone();
        let mounted = self.run(move |manager| manager.mount(&name)).await?;
        Self::mount_changed(&emitter, &remote, mounted.state.label())
            .await
            .ok();
        Ok(to_json(&mounted)?)
    }

    async fn unmount(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        remote: String,
    ) -> zbus::fdo::Result<bool> {
        info!(remote = %remote, "D-Bus unmount request");
        let name = remote.clone();
        let unmounted = self.run(move |manager| manager.unmount(&name)).await?;
        if unmounted {
            Self::mount_changed(&emitter, &remote, MountState::Stopped.label())
                .await
                .ok();
        }
        Ok(unmounted)
    }

    async fn is_mounted(&self, remote: String) -> zbus::fdo::Result<bool> {
        Ok(self
            .run(move |manager| Ok(manager.is_mounted(&remote)))
            .await?)
    }

    /// Abort a mount that is still being verified
    async fn cancel_mount(&self, remote: String) -> zbus::fdo::Result<bool> {
        Ok(self
            .run(move |manager| Ok(manager.cancel_mount(&remote)))
            .await?)
    }

    /// JSON array of `MountInfo`, including in-flight attempts
    async fn mounts(&self) -> zbus::fdo::Result<String> {
        let mounts = self.run(|manager| Ok(manager.mounts())).await?;
        Ok(to_json(&mounts)?)
    }

    async fn refresh(&self) -> zbus::fdo::Result<String> {
        let mounts = self.run(|manager| Ok(manager.refresh())).await?;
        Ok(to_json(&mounts)?)
    }

    /// Start `rclone sync`; returns the JSON `TransferInfo`
    async fn sync(
        &self,
        source: String,
        dest: String,
        flags: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        let job = self
            .run(move |manager| manager.sync(&source, &dest, &flags))
            .await?;
        Ok(to_json(&job)?)
    }

    /// Start `rclone copy`; returns the JSON `TransferInfo`
    async fn copy(
        &self,
        source: String,
        dest: String,
        flags: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        let job = self
            .run(move |manager| manager.copy(&source, &dest, &flags))
            .await?;
        Ok(to_json(&job)?)
    }

    async fn get_transfers(&self) -> zbus::fdo::Result<String> {
        let jobs = self.run(|manager| Ok(manager.transfers())).await?;
        Ok(to_json(&jobs)?)
    }

    async fn cancel_transfer(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        id: String,
    ) -> zbus::fdo::Result<bool> {
        let job = id.clone();
        let cancelled = self
            .run(move |manager| Ok(manager.cancel_transfer(&job)))
            .await?;
        if cancelled {
            Self::transfer_finished(&emitter, &id, "cancelled").await.ok();
        }
        Ok(cancelled)
    }

    /// Number of running transfers that received the new limit
    async fn set_bandwidth_limit(&self, limit: String) -> zbus::fdo::Result<u32> {
        let delivered = self
            .run(move |manager| Ok(manager.set_bandwidth_limit(&limit)))
            .await?;
        Ok(u32::try_from(delivered).unwrap_or(u32::MAX))
    }

    async fn clear_finished_transfers(&self) -> zbus::fdo::Result<u32> {
        let cleared = self
            .run(|manager| Ok(manager.clear_finished_transfers()))
            .await?;
        Ok(u32::try_from(cleared).unwrap_or(u32::MAX))
    }

    /// JSON `TrayConfig` currently in effect
    async fn config(&self) -> zbus::fdo::Result<String> {
        let config = self.run(|manager| Ok(manager.config())).await?;
        Ok(to_json(&config)?)
    }

    /// Unmount everything and stop every transfer
    async fn cleanup(&self) -> zbus::fdo::Result<()> {
        Ok(self
            .run(|manager| {
                manager.cleanup();
                Ok(())
            })
            .await?)
    }
}

/// Poll transfers on an interval and turn state changes into signals
pub async fn watch(
    connection: Connection,
    manager: Arc<RcloneManager>,
    interval: Duration,
) -> AnyResult<()> {
    let iface_ref = connection
        .object_server()
        .interface::<_, TrayService>(OBJECT_PATH)
        .await?;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks: u32 = 0;

        loop {
            ticker.tick().await;
            ticks = ticks.wrapping_add(1);

            let finished =
                match run_blocking(Arc::clone(&manager), |m| Ok(m.poll_transfers())).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        error!("Transfer poll failed: {}", e);
                        continue;
                    }
                };
            for job in finished {
                debug!(job = %job.id, "Emitting transfer_finished");
                if let Err(e) = TrayService::transfer_finished(
                    iface_ref.signal_emitter(),
                    &job.id,
                    job.status.as_str(),
                )
                .await
                {
                    error!("Failed to emit transfer_finished signal: {}", e);
                }
            }

            if ticks % RECONCILE_EVERY != 0 {
                continue;
            }
            let failed = match run_blocking(Arc::clone(&manager), |m| Ok(m.reconcile_mounts()))
                .await
            {
                Ok(failed) => failed,
                Err(e) => {
                    error!("Mount reconciliation failed: {}", e);
                    continue;
                }
            };
            for mount in failed {
                if let Err(e) = TrayService::mount_changed(
                    iface_ref.signal_emitter(),
                    &mount.remote,
                    mount.state.label(),
                )
                .await
                {
                    error!("Failed to emit mount_changed signal: {}", e);
                }
            }
        }
    });

    Ok(())
}
