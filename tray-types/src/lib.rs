// SPDX-License-Identifier: GPL-3.0-only

//! Data models shared between the rclone tray supervisor and its front ends
//!
//! These are plain serde types. The supervisor owns the live state (process
//! handles, line buffers) and hands out these snapshots to anything that
//! renders them, whether over D-Bus or on the command line.

pub mod mount;
pub mod remote;
pub mod transfer;

pub use mount::{MountInfo, MountState};
pub use remote::{RemoteInfo, RemoteUsage};
pub use transfer::{TransferInfo, TransferKind, TransferProgress, TransferStatus};
