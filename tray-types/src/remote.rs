// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A configured remote as shown by a dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub name: String,

    /// Backend type from rclone.conf (`drive`, `s3`, ...), if readable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_type: Option<String>,

    pub mount_point: PathBuf,

    pub mounted: bool,
}

/// Output of `rclone about <remote>: --json`
///
/// Every field is optional because backends only report what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_tolerates_partial_reports() {
        let usage: RemoteUsage =
            serde_json::from_str(r#"{"total": 100, "used": 40}"#).expect("parse usage");
        assert_eq!(usage.total, Some(100));
        assert_eq!(usage.used, Some(40));
        assert_eq!(usage.free, None);
    }
}
