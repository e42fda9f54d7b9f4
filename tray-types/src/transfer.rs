// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which rclone subcommand a transfer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Sync,
    Copy,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Sync => "sync",
            TransferKind::Copy => "copy",
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransferKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(TransferKind::Sync),
            "copy" => Ok(TransferKind::Copy),
            _ => Err(format!("Invalid transfer kind: {}", s)),
        }
    }
}

/// `Starting -> Running -> {Completed, Failed, Cancelled}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    #[default]
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Starting => "starting",
            TransferStatus::Running => "running",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed stats line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// 0..=100
    pub percent: u8,
    /// Human readable rate as rclone printed it, e.g. `123.45M/s`
    pub speed: String,
    /// As printed, e.g. `2m30s` or `-`
    pub eta: String,
}

/// Snapshot of a transfer job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub id: String,
    pub kind: TransferKind,
    pub source: String,
    pub dest: String,
    pub status: TransferStatus,
    pub progress_percent: u8,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub eta: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TransferInfo {
    pub fn new(id: String, kind: TransferKind, source: String, dest: String) -> Self {
        Self {
            id,
            kind,
            source,
            dest,
            status: TransferStatus::Starting,
            progress_percent: 0,
            speed: String::new(),
            eta: String::new(),
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
        }
    }

    pub fn apply_progress(&mut self, progress: &TransferProgress) {
        self.progress_percent = progress.percent.min(100);
        self.speed = progress.speed.clone();
        self.eta = progress.eta.clone();
    }
}
