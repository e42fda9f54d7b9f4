// SPDX-License-Identifier: GPL-3.0-only

//! Is a path an active mount point, and how to force it off
//!
//! Verification asks `findmnt` first and falls back to reading the raw
//! mounts listing when `findmnt` is missing or errors. Forced unmount walks
//! an ordered list of utilities and stops at the first one that succeeds.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, trace, warn};
use which::which;

use crate::error::{Result, SysError};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Answers whether a path is currently a mount point
pub trait MountVerifier: Send + Sync {
    /// Side-effect free. A path that does not exist is simply not mounted;
    /// a listed mount point that cannot be stat'ed still counts as mounted.
    fn is_mounted(&self, path: &Path) -> bool;

    /// Whether a mounted path still answers. A FUSE mount whose daemon died
    /// stays in the table but fails every stat.
    fn is_responsive(&self, path: &Path) -> bool {
        std::fs::metadata(path).is_ok()
    }
}

/// Removes a mount regardless of who owns it
pub trait ForceUnmount: Send + Sync {
    /// Succeeds when the path ends up unmounted, including when it never was
    fn force_unmount(&self, path: &Path) -> Result<()>;
}

/// `MountVerifier` backed by the OS mount table
#[derive(Debug, Clone)]
pub struct MountTable {
    findmnt: Option<PathBuf>,
    mounts_file: PathBuf,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    pub fn new() -> Self {
        let findmnt = which("findmnt").ok();
        if findmnt.is_none() {
            debug!("findmnt not found, verifying mounts from {}", PROC_MOUNTS);
        }
        Self::with_sources(findmnt, PROC_MOUNTS)
    }

    /// Explicit sources; `None` skips the mount-table query entirely
    pub fn with_sources(findmnt: Option<PathBuf>, mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            findmnt,
            mounts_file: mounts_file.into(),
        }
    }

    /// `Some(answer)` from findmnt, `None` when it could not be asked
    fn query_findmnt(&self, path: &Path) -> Option<bool> {
        let findmnt = self.findmnt.as_ref()?;
        let output = match Command::new(findmnt)
            .args(["--noheadings", "--output", "TARGET", "--mountpoint"])
            .arg(path)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to run {}: {}", findmnt.display(), e);
                return None;
            }
        };

        // findmnt exits 1 with no output when nothing matches
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            if stdout.trim().is_empty() && output.stderr.is_empty() {
                return Some(false);
            }
            debug!(
                "findmnt failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let target = path.to_string_lossy();
        Some(stdout.lines().any(|line| line.trim() == target))
    }

    fn scan_mounts_file(&self, path: &Path) -> bool {
        match std::fs::read_to_string(&self.mounts_file) {
            Ok(listing) => mounts_listing_contains(&listing, path),
            Err(e) => {
                warn!("Failed to read {}: {}", self.mounts_file.display(), e);
                false
            }
        }
    }
}

impl MountVerifier for MountTable {
    fn is_mounted(&self, path: &Path) -> bool {
        // A crashed FUSE mount stays listed while stat fails with ENOTCONN
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let mounted = match self.query_findmnt(&target) {
            Some(answer) => answer,
            None => self.scan_mounts_file(&target),
        };
        trace!("{} mounted: {}", target.display(), mounted);
        mounted
    }
}

/// Whether a `/proc/mounts`-format listing has `path` as a mount target
///
/// Targets are compared whole after unescaping, so `/mnt/foo` does not
/// match `/mnt/foobar`.
pub fn mounts_listing_contains(listing: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(_source), Some(target)) => unescape_mount_path(target) == wanted,
            _ => false,
        }
    })
}

/// Undo the octal escaping `/proc/mounts` applies (`\040` is a space)
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let digits = &raw[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One step of the forced-unmount chain
#[derive(Debug, Clone, PartialEq, Eq)]
struct UnmountStep {
    program: &'static str,
    args: &'static [&'static str],
}

const UNMOUNT_CHAIN: &[UnmountStep] = &[
    UnmountStep {
        program: "fusermount3",
        args: &["-u", "-z"],
    },
    UnmountStep {
        program: "fusermount",
        args: &["-u", "-z"],
    },
    UnmountStep {
        program: "umount",
        args: &["-l"],
    },
];

/// Lazy FUSE unmount with `umount -l` as the last resort
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseUnmount;

impl ForceUnmount for FuseUnmount {
    fn force_unmount(&self, path: &Path) -> Result<()> {
        let mut failures = Vec::new();

        for step in UNMOUNT_CHAIN {
            let Ok(program) = which(step.program) else {
                trace!("{} not installed, skipping", step.program);
                continue;
            };

            let output = match Command::new(&program).args(step.args).arg(path).output() {
                Ok(output) => output,
                Err(e) => {
                    failures.push(format!("{}: {}", step.program, e));
                    continue;
                }
            };

            if output.status.success() {
                debug!("{} unmounted {}", step.program, path.display());
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_mounted_message(&stderr) {
                debug!("{} was not mounted", path.display());
                return Ok(());
            }
            failures.push(format!("{}: {}", step.program, stderr.trim()));
        }

        if failures.is_empty() {
            return Err(SysError::OperationFailed(
                "no unmount utility available (fusermount3, fusermount, umount)".to_string(),
            ));
        }
        Err(SysError::OperationFailed(format!(
            "forced unmount of {} failed: {}",
            path.display(),
            failures.join("; ")
        )))
    }
}

fn is_not_mounted_message(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    ["not mounted", "not found in /etc/mtab", "not a mountpoint", "no mount point specified"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new(label: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos();
            let path = std::env::temp_dir().join(format!(
                "tray-sys-{label}-{}-{nanos}",
                std::process::id()
            ));
            std::fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(unescape_mount_path(r"/mnt/My\040Drive"), "/mnt/My Drive");
        assert_eq!(unescape_mount_path(r"/mnt/tab\011x"), "/mnt/tab\tx");
        assert_eq!(unescape_mount_path(r"/mnt/odd\04"), r"/mnt/odd\04");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }

    #[test]
    fn listing_match_is_exact() {
        let listing = "\
gdrive: /home/me/mnt/gdrive fuse.rclone rw,nosuid,nodev 0 0
box: /home/me/mnt/My\\040Box fuse.rclone rw 0 0
";
        assert!(mounts_listing_contains(listing, Path::new("/home/me/mnt/gdrive")));
        assert!(mounts_listing_contains(listing, Path::new("/home/me/mnt/My Box")));
        assert!(!mounts_listing_contains(listing, Path::new("/home/me/mnt/gdr")));
        assert!(!mounts_listing_contains(listing, Path::new("/home/me/mnt")));
        assert!(!mounts_listing_contains("garbage", Path::new("/home")));
    }

    #[test]
    fn missing_path_is_not_mounted() {
        let table = MountTable::with_sources(None, "/proc/mounts");
        assert!(!table.is_mounted(Path::new("/nonexistent/rclone-tray/remote")));
    }

    #[test]
    fn falls_back_to_mounts_file() {
        let dir = TempDir::new("mounts");
        let target = dir.path.join("remote");
        std::fs::create_dir_all(&target).expect("create target");
        let target = target.canonicalize().expect("canonical target");

        let listing = dir.path.join("mounts");
        std::fs::write(
            &listing,
            format!("remote: {} fuse.rclone rw 0 0\n", target.display()),
        )
        .expect("write listing");

        let table = MountTable::with_sources(None, &listing);
        assert!(table.is_mounted(&target));

        std::fs::write(&listing, "").expect("clear listing");
        assert!(!table.is_mounted(&target));
    }

    #[test]
    fn listed_mount_point_that_cannot_be_stated() {
        let dir = TempDir::new("dead");
        let root = dir.path.canonicalize().expect("canonical dir");
        let file = root.join("file");
        std::fs::write(&file, "").expect("write file");
        let target = file.join("mnt");
        assert!(std::fs::metadata(&target).is_err());

        let listing = root.join("mounts");
        std::fs::write(
            &listing,
            format!("remote: {} fuse.rclone rw 0 0\n", target.display()),
        )
        .expect("write listing");

        let table = MountTable::with_sources(None, &listing);
        assert!(table.is_mounted(&target));
        assert!(!table.is_responsive(&target));
        assert!(table.is_responsive(&root));
    }

    #[test]
    fn findmnt_failure_falls_back() {
        let dir = TempDir::new("findmnt");
        let target = dir.path.canonicalize().expect("canonical dir");
        let listing = target.join("mounts");
        std::fs::write(
            &listing,
            format!("remote: {} fuse.rclone rw 0 0\n", target.display()),
        )
        .expect("write listing");

        let table =
            MountTable::with_sources(Some(PathBuf::from("/nonexistent/findmnt")), &listing);
        assert!(table.is_mounted(&target));
    }

    #[test]
    fn recognizes_not_mounted_errors() {
        assert!(is_not_mounted_message(
            "fusermount3: entry for /home/me/mnt/x not found in /etc/mtab"
        ));
        assert!(is_not_mounted_message("umount: /mnt/x: not mounted."));
        assert!(!is_not_mounted_message("umount: /mnt/x: target is busy."));
    }

    #[test]
    fn forced_unmount_of_plain_dir_is_ok_or_reports() {
        let dir = TempDir::new("unmount");
        // Whatever utilities exist, an unmounted dir must not panic and any
        // error must name the path or the missing tools.
        if let Err(SysError::OperationFailed(message)) = FuseUnmount.force_unmount(&dir.path) {
            assert!(
                message.contains("unmount")
                    || message.contains(&dir.path.display().to_string())
            );
        }
    }
}
