// SPDX-License-Identifier: GPL-3.0-only

//! Command-line assembly for `rclone mount` and `rclone sync|copy`

use std::path::{Path, PathBuf};

use tray_types::TransferKind;

/// Flags every mount gets unless the caller already set them
///
/// Order matters only for readability of the logged command line.
pub const MOUNT_RELIABILITY_DEFAULTS: &[(&str, Option<&str>)] = &[
    ("--daemon", None),
    ("--log-level", Some("DEBUG")),
    ("--stats", Some("1s")),
    ("--dir-cache-time", Some("5m")),
    ("--poll-interval", Some("15s")),
    ("--vfs-write-back", Some("5s")),
    ("--vfs-read-chunk-size", Some("32M")),
    ("--vfs-cache-max-age", Some("1h")),
    ("--vfs-read-ahead", Some("128M")),
    ("--buffer-size", Some("32M")),
    ("--transfers", Some("4")),
    ("--low-level-retries", Some("3")),
    ("--contimeout", Some("15s")),
    ("--timeout", Some("30s")),
];

/// Fixed concurrency and one-line stats for sync/copy jobs
pub const TRANSFER_DEFAULTS: &[(&str, Option<&str>)] = &[
    ("--transfers", Some("4")),
    ("--checkers", Some("8")),
    ("--stats", Some("1s")),
    ("--stats-one-line", None),
];

const SIZE_UNITS: &[char] = &['K', 'M', 'G', 'T', 'P'];

/// `0`, `off` and the empty string all mean no limit
pub fn is_unlimited(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == "0" || value.eq_ignore_ascii_case("off")
}

/// Append `default_unit` to a bare number; anything carrying a size unit is
/// passed through untouched
pub fn normalize_size(value: &str, default_unit: char) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    let has_unit = value
        .chars()
        .any(|c| SIZE_UNITS.contains(&c.to_ascii_uppercase()));
    if has_unit {
        value.to_string()
    } else {
        format!("{value}{default_unit}")
    }
}

/// Bandwidth in MB/s unless a unit is given
pub fn normalize_rate(value: &str) -> String {
    normalize_size(value, 'M')
}

pub fn normalize_seconds(seconds: u64) -> String {
    format!("{seconds}s")
}

fn has_flag(args: &[String], flag: &str) -> bool {
    let with_value = format!("{flag}=");
    args.iter()
        .any(|arg| arg == flag || arg.starts_with(&with_value))
}

fn push_defaults(args: &mut Vec<String>, defaults: &[(&str, Option<&str>)]) {
    for (flag, value) in defaults {
        if has_flag(args, flag) {
            continue;
        }
        args.push((*flag).to_string());
        if let Some(value) = value {
            args.push((*value).to_string());
        }
    }
}

/// Network tuning shared by mounts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    pub bandwidth_limit: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub low_level_retries: u32,
    pub buffer_size: String,
    pub transfers: u32,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            bandwidth_limit: "0".to_string(),
            timeout_secs: 30,
            retries: 3,
            low_level_retries: 10,
            buffer_size: "256M".to_string(),
            transfers: 4,
        }
    }
}

impl NetworkOptions {
    pub fn push_args(&self, args: &mut Vec<String>) {
        if !is_unlimited(&self.bandwidth_limit) {
            args.push("--bwlimit".to_string());
            args.push(normalize_rate(&self.bandwidth_limit));
        }
        if self.timeout_secs > 0 {
            args.push("--timeout".to_string());
            args.push(normalize_seconds(self.timeout_secs));
        }
        if self.retries > 0 {
            args.push("--retries".to_string());
            args.push(self.retries.to_string());
        }
        if self.low_level_retries > 0 {
            args.push("--low-level-retries".to_string());
            args.push(self.low_level_retries.to_string());
        }
        let buffer_size = normalize_size(&self.buffer_size, 'M');
        if !buffer_size.is_empty() {
            args.push("--buffer-size".to_string());
            args.push(buffer_size);
        }
        if self.transfers > 0 {
            args.push("--transfers".to_string());
            args.push(self.transfers.to_string());
        }
    }
}

/// Builder for the `rclone mount` argument list
#[derive(Debug, Clone)]
pub struct MountArgs {
    remote: String,
    mount_point: PathBuf,
    config: Option<PathBuf>,
    options: Vec<String>,
    network: Option<NetworkOptions>,
}

impl MountArgs {
    pub fn new(remote: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            mount_point: mount_point.into(),
            config: None,
            options: Vec::new(),
            network: None,
        }
    }

    pub fn config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// Raw extra flags, already split
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn network(mut self, network: NetworkOptions) -> Self {
        self.network = Some(network);
        self
    }

    /// Mandatory arguments, then config, then caller options, then network
    /// settings, then whichever reliability defaults were not already given
    pub fn build(&self) -> Vec<String> {
        let mut args = vec![
            "mount".to_string(),
            format!("{}:/", self.remote),
            self.mount_point.to_string_lossy().into_owned(),
            "--vfs-cache-mode".to_string(),
            "full".to_string(),
        ];

        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }

        args.extend(self.options.iter().cloned());

        if let Some(network) = &self.network {
            network.push_args(&mut args);
        }

        push_defaults(&mut args, MOUNT_RELIABILITY_DEFAULTS);
        args
    }
}

/// `rclone <sync|copy> <source> <dest> --progress ...`
///
/// Caller flags come last and suppress any fixed default of the same name.
pub fn transfer_args(
    kind: TransferKind,
    source: &str,
    dest: &str,
    config: Option<&Path>,
    flags: &[String],
) -> Vec<String> {
    let mut args = vec![
        kind.as_str().to_string(),
        source.to_string(),
        dest.to_string(),
        "--progress".to_string(),
    ];

    if let Some(config) = config {
        args.push("--config".to_string());
        args.push(config.to_string_lossy().into_owned());
    }

    for (flag, value) in TRANSFER_DEFAULTS {
        if has_flag(flags, flag) {
            continue;
        }
        args.push((*flag).to_string());
        if let Some(value) = value {
            args.push((*value).to_string());
        }
    }

    args.extend(flags.iter().cloned());
    args
}
