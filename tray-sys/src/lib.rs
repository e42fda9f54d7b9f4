// SPDX-License-Identifier: GPL-3.0-only

//! System-level plumbing for the rclone tray supervisor
//!
//! Synchronous wrappers over processes, the mount table and the rclone CLI.
//! Everything the supervisors touch in the OS goes through a trait defined
//! here so it can be swapped in tests.

pub mod error;
pub mod mount_table;
pub mod process;
pub mod process_finder;
pub mod rclone;

pub use error::{Result, SysError};
pub use mount_table::{ForceUnmount, FuseUnmount, MountTable, MountVerifier};
pub use process::{
    ChildProcess, DiscoveredProcess, LaunchSpec, ProcessHandle, ProcessLauncher, SpawnLauncher,
};
pub use process_finder::{ProcTable, ProcessDiscovery, ProcessInfo};
pub use rclone::args::{
    MountArgs, NetworkOptions, is_unlimited, normalize_rate, normalize_size, transfer_args,
};
pub use rclone::stats::{LineBuffer, parse_stats_line};
pub use rclone::{RCloneCli, RemoteLister};
