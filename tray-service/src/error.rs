// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;
use tray_sys::SysError;
use zbus::fdo;

/// Structural mount failures
///
/// An already-active mount is not represented here: mounting it again
/// resolves to the existing entry.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("Invalid remote name: {0:?}")]
    InvalidRemote(String),

    #[error("rclone configuration not found at {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("Failed to launch mount for {remote}: {output}")]
    LaunchFailure { remote: String, output: String },

    #[error("Mount for {remote} not visible after {attempts} attempts: {output}")]
    VerificationTimeout {
        remote: String,
        attempts: u32,
        output: String,
    },

    #[error("A mount of {0} is already in progress")]
    InProgress(String),

    #[error("Mount of {0} was cancelled")]
    Cancelled(String),

    #[error("Unmount of {remote} only partially succeeded: {detail}")]
    TeardownPartialFailure { remote: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to launch transfer: {0}")]
    LaunchFailure(String),

    #[error("Unknown transfer: {0}")]
    UnknownJob(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to write configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors crossing the D-Bus boundary
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sys(#[from] SysError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task failed: {0}")]
    Task(String),
}

impl From<ServiceError> for fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidArgument(msg) => fdo::Error::InvalidArgs(msg),
            ServiceError::Mount(MountError::InvalidRemote(name)) => {
                fdo::Error::InvalidArgs(format!("Invalid remote name: {name:?}"))
            }
            ServiceError::Transfer(TransferError::UnknownJob(id)) => {
                fdo::Error::InvalidArgs(format!("Unknown transfer: {id}"))
            }
            ServiceError::Config(ConfigError::Invalid(msg)) => fdo::Error::InvalidArgs(msg),
            ServiceError::Sys(SysError::RcloneNotFound) => {
                fdo::Error::NotSupported(SysError::RcloneNotFound.to_string())
            }
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServiceError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
