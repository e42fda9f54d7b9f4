// SPDX-License-Identifier: GPL-3.0-only

//! Supervised `rclone mount` processes

mod registry;
mod supervisor;

pub use registry::{MountAttempt, MountEntry, MountRegistry};
pub use supervisor::{MountOptions, MountPolicy, MountSupervisor};
