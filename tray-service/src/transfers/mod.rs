// SPDX-License-Identifier: GPL-3.0-only

//! One-shot `rclone sync` and `rclone copy` jobs

mod registry;
mod supervisor;

pub use registry::{TransferJob, TransferRegistry};
pub use supervisor::TransferSupervisor;
