// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LoggingLevel, LoggingSettings};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_PREFIX: &str = "rclone-tray.log";
const KEEP_DAYS: u64 = 7;

/// Default filter when `RUST_LOG` is not set
pub fn default_directives(level: LoggingLevel) -> String {
    let level = level.as_directive();
    format!("rclone_trayd={level},tray_service={level},tray_sys={level},warn")
}

/// Install the global subscriber: stderr always, plus a daily rolling file
/// when `to_disk` is set. Safe to call once per process.
pub fn init(settings: &LoggingSettings) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(settings.level)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    if !settings.to_disk {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init();
        return;
    }

    match file_writer() {
        Ok((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);

            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();

            let _ = LOG_GUARD.set(guard);
        }
        Err(e) => {
            eprintln!("rclone-tray: failed to initialize file logging: {e:#}");
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
        }
    }
}

fn file_writer() -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = log_dir();

    if let Err(e) = fs::create_dir_all(&dir) {
        return Err(anyhow::anyhow!(
            "create log directory failed: {} ({})",
            dir.display(),
            e
        ));
    }

    let prefix = OsString::from(LOG_PREFIX);
    cleanup_old_logs(&dir, &prefix, SystemTime::now());

    let appender = tracing_appender::rolling::daily(&dir, &prefix);
    Ok(tracing_appender::non_blocking(appender))
}

/// `RCLONE_TRAY_LOG_DIR`, else `$XDG_STATE_HOME/rclone-tray/logs`
pub fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("RCLONE_TRAY_LOG_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(xdg_state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(xdg_state).join("rclone-tray").join("logs");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("state")
            .join("rclone-tray")
            .join("logs");
    }

    PathBuf::from("/tmp").join("rclone-tray").join("logs")
}

fn cleanup_old_logs(dir: &Path, prefix: &OsString, now: SystemTime) {
    let Some(cutoff) = now.checked_sub(Duration::from_secs(KEEP_DAYS * 24 * 60 * 60)) else {
        return;
    };

    let prefix = prefix.to_string_lossy();

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        // Only files written by our appender
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with(prefix.as_ref())
        {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|metadata| metadata.modified()) else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        let _ = fs::remove_file(entry.path());
    }
}
