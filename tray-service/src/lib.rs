// SPDX-License-Identifier: GPL-3.0-only

//! Supervision core for the rclone tray
//!
//! Keeps `rclone mount` processes and one-shot `sync`/`copy` jobs under
//! control: launches them, confirms mounts in the OS mount table, parses
//! transfer progress and tears everything down on shutdown. The same
//! [`RcloneManager`] backs the D-Bus daemon and the command line.

pub mod config;
pub mod dbus;
pub mod error;
pub mod logging;
pub mod manager;
pub mod mounts;
pub mod transfers;

#[cfg(test)]
mod testing;

pub use config::TrayConfig;
pub use error::{ConfigError, MountError, Result, ServiceError, TransferError};
pub use manager::{Backends, RcloneManager};
