// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a supervised mount
///
/// `Starting -> Verifying -> Active -> Stopping -> Stopped`, with
/// `Verifying -> Failed` when verification gives up and `Active -> Failed`
/// when the mount disappears underneath us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum MountState {
    Starting,
    Verifying,
    Active,
    Stopping,
    #[default]
    Stopped,
    Failed(String),
}

impl MountState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MountState::Stopped | MountState::Failed(_))
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, MountState::Starting | MountState::Verifying)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, MountState::Active)
    }

    pub fn label(&self) -> &'static str {
        match self {
            MountState::Starting => "starting",
            MountState::Verifying => "verifying",
            MountState::Active => "active",
            MountState::Stopping => "stopping",
            MountState::Stopped => "stopped",
            MountState::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Remote name, without the trailing `:`
    pub remote: String,

    /// `<mount_base_dir>/<remote>`
    pub mount_point: PathBuf,

    pub state: MountState,

    /// Full argument list the mount process was started with. Empty for
    /// mounts found on the system rather than started by us.
    #[serde(default)]
    pub launch_args: Vec<String>,

    /// Pid of the process we can signal, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Best guess at the daemonized `rclone mount` process. Diagnostic only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_hint: Option<u32>,

    /// True when the mount was discovered rather than launched by us
    #[serde(default)]
    pub external: bool,
}
