// SPDX-License-Identifier: GPL-3.0-only

//! Process-table lookups via procfs
//!
//! Used to put a pid on mounts that were started before we were, and to spot
//! a `fusermount` helper while a mount is still coming up. Matching is by
//! command line, so every answer here is a hint.

use std::path::Path;

use procfs::process::ProcState;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
}

/// Process-table queries the mount supervisor relies on
pub trait ProcessDiscovery: Send + Sync {
    /// Pid of an `rclone mount <remote>:` process, if one is running
    fn find_mount_owner(&self, remote: &str) -> Option<u32>;

    /// Whether a `fusermount` process mentioning `mount_point` exists
    fn fuse_helper_running(&self, mount_point: &Path) -> bool;
}

/// `ProcessDiscovery` over `/proc`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcTable;

impl ProcessDiscovery for ProcTable {
    fn find_mount_owner(&self, remote: &str) -> Option<u32> {
        let owners = find_processes(|cmdline| is_mount_command(cmdline, remote));
        if owners.len() > 1 {
            debug!(
                "Found {} rclone mount processes for {}, using the oldest",
                owners.len(),
                remote
            );
        }
        owners.iter().map(|process| process.pid).min()
    }

    fn fuse_helper_running(&self, mount_point: &Path) -> bool {
        !find_processes(|cmdline| is_fusermount_for(cmdline, mount_point)).is_empty()
    }
}

/// Every live process whose argv satisfies `matches`
///
/// Processes that vanish or deny access mid-scan are skipped silently.
pub fn find_processes<F>(matches: F) -> Vec<ProcessInfo>
where
    F: Fn(&[String]) -> bool,
{
    let all_procs = match procfs::process::all_processes() {
        Ok(procs) => procs,
        Err(e) => {
            warn!("Failed to enumerate processes: {}", e);
            return Vec::new();
        }
    };

    let mut result = Vec::new();
    for proc_result in all_procs {
        let Ok(process) = proc_result else {
            continue;
        };
        let Ok(cmdline) = process.cmdline() else {
            continue;
        };
        // Kernel threads have no argv
        if cmdline.is_empty() || !matches(&cmdline) {
            continue;
        }
        if is_zombie(&process) {
            continue;
        }
        result.push(ProcessInfo {
            pid: process.pid() as u32,
            cmdline,
        });
    }

    result
}

/// argv of a live process, `None` if it is gone or a zombie
pub fn process_cmdline(pid: u32) -> Option<Vec<String>> {
    let process = procfs::process::Process::new(pid as i32).ok()?;
    if is_zombie(&process) {
        return None;
    }
    process.cmdline().ok().filter(|cmdline| !cmdline.is_empty())
}

fn is_zombie(process: &procfs::process::Process) -> bool {
    process
        .stat()
        .ok()
        .and_then(|stat| stat.state().ok())
        .is_some_and(|state| matches!(state, ProcState::Zombie | ProcState::Dead))
}

fn program_name(cmdline: &[String]) -> Option<&str> {
    let first = cmdline.first()?;
    Path::new(first).file_name().and_then(|name| name.to_str())
}

/// `rclone mount <remote>:...` for exactly this remote
pub fn is_mount_command(cmdline: &[String], remote: &str) -> bool {
    let Some(program) = program_name(cmdline) else {
        return false;
    };
    if !program.starts_with("rclone") {
        return false;
    }

    let remote_root = format!("{remote}:");
    let mut args = cmdline.iter().skip(1);
    args.any(|arg| arg == "mount") && cmdline.iter().any(|arg| arg.starts_with(&remote_root))
}

pub fn is_fusermount_for(cmdline: &[String], mount_point: &Path) -> bool {
    let Some(program) = program_name(cmdline) else {
        return false;
    };
    if !program.starts_with("fusermount") {
        return false;
    }
    let target = mount_point.to_string_lossy();
    cmdline.iter().skip(1).any(|arg| arg.contains(target.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn matches_rclone_mount_for_the_exact_remote() {
        let cmdline = argv(&[
            "/usr/bin/rclone",
            "mount",
            "gdrive:/",
            "/home/me/mnt/gdrive",
            "--daemon",
        ]);
        assert!(is_mount_command(&cmdline, "gdrive"));
        assert!(!is_mount_command(&cmdline, "gdr"));
        assert!(!is_mount_command(&cmdline, "gdrive2"));
    }

    #[test]
    fn ignores_other_rclone_subcommands() {
        let cmdline = argv(&["rclone", "sync", "gdrive:/", "/tmp/backup"]);
        assert!(!is_mount_command(&cmdline, "gdrive"));

        let not_rclone = argv(&["grep", "mount", "gdrive:"]);
        assert!(!is_mount_command(&not_rclone, "gdrive"));
    }

    #[test]
    fn matches_fusermount_helper() {
        let mount_point = Path::new("/home/me/mnt/gdrive");
        let helper = argv(&["fusermount3", "-o", "rw", "--", "/home/me/mnt/gdrive"]);
        assert!(is_fusermount_for(&helper, mount_point));

        let other = argv(&["fusermount3", "-u", "/home/me/mnt/other"]);
        assert!(!is_fusermount_for(&other, mount_point));
        assert!(!is_fusermount_for(&[], mount_point));
    }

    #[test]
    fn reads_own_cmdline() {
        let cmdline = process_cmdline(std::process::id()).expect("own cmdline");
        assert!(!cmdline.is_empty());

        let own = find_processes(|candidate| candidate == cmdline.as_slice());
        assert!(own.iter().any(|process| process.pid == std::process::id()));
    }

    #[test]
    fn missing_pid_has_no_cmdline() {
        assert!(process_cmdline(u32::MAX / 2).is_none());
    }
}
