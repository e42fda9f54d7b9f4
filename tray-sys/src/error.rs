// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rclone is not installed or not in PATH")]
    RcloneNotFound,

    #[error("rclone configuration not found at {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Failed to parse rclone configuration: {0}")]
    ConfigParse(String),

    #[error("Failed to launch process: {0}")]
    LaunchFailed(String),

    #[error("Process did not start within {0:?}")]
    LaunchTimeout(Duration),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
