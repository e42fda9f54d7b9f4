// SPDX-License-Identifier: GPL-3.0-only

//! Read-only rclone CLI operations
//!
//! Wrappers around the rclone command-line tool for listing remotes,
//! reading the rclone configuration and querying remote usage. Launching
//! long-running mounts and transfers goes through `ProcessLauncher` instead.

pub mod args;
pub mod stats;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use configparser::ini::Ini;
use tracing::{debug, info, warn};
use tray_types::RemoteUsage;
use which::which;

use crate::error::{Result, SysError};

/// Sections of rclone.conf: remote name to its key/value pairs
pub type RemoteConfig = HashMap<String, HashMap<String, Option<String>>>;

/// Lists configured remotes; never fails
pub trait RemoteLister: Send + Sync {
    /// Remote names without the trailing `:`. Empty when the configuration
    /// is missing or cannot be queried.
    fn list_remotes(&self) -> Vec<String>;

    /// Backend type (`drive`, `s3`, ...) of a remote
    fn remote_type(&self, _remote: &str) -> Option<String> {
        None
    }

    fn usage(&self, remote: &str) -> Result<RemoteUsage> {
        Err(SysError::OperationFailed(format!(
            "usage of {remote} is not available"
        )))
    }
}

/// RClone CLI wrapper
pub struct RCloneCli {
    binary_path: PathBuf,
    config_path: PathBuf,
}

impl RCloneCli {
    /// Locate the rclone binary and confirm it runs
    ///
    /// `program` is a name looked up in PATH or an explicit path.
    pub fn new(program: impl AsRef<Path>, config_path: impl Into<PathBuf>) -> Result<Self> {
        let binary_path = Self::find_rclone_binary(program.as_ref())?;
        let cli = Self::with_binary(binary_path, config_path);
        let version = cli.version()?;
        info!("Using {} at {:?}", version, cli.binary_path);
        Ok(cli)
    }

    /// Skip the PATH lookup and version probe
    pub fn with_binary(binary_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_path: config_path.into(),
        }
    }

    pub fn find_rclone_binary(program: &Path) -> Result<PathBuf> {
        which(program).map_err(|_| SysError::RcloneNotFound)
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// First line of `rclone version`
    pub fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary_path)
            .arg("version")
            .output()
            .map_err(|_| SysError::RcloneNotFound)?;

        if !output.status.success() {
            return Err(SysError::RcloneNotFound);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("rclone").trim().to_string())
    }

    /// `rclone listremotes`, surfacing failures
    pub fn try_list_remotes(&self) -> Result<Vec<String>> {
        if !self.config_path.exists() {
            return Err(SysError::ConfigNotFound(self.config_path.clone()));
        }
        debug!("Listing remotes from {:?}", self.config_path);

        let output = Command::new(&self.binary_path)
            .arg("listremotes")
            .arg("--config")
            .arg(&self.config_path)
            .output()
            .map_err(|e| SysError::OperationFailed(format!("Failed to execute rclone: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SysError::OperationFailed(format!(
                "rclone listremotes failed: {}",
                stderr.trim()
            )));
        }

        let remotes = parse_listremotes(&String::from_utf8_lossy(&output.stdout));
        debug!("Found {} remotes", remotes.len());
        Ok(remotes)
    }

    /// Parse rclone.conf
    pub fn read_config(&self) -> Result<RemoteConfig> {
        if !self.config_path.exists() {
            return Err(SysError::ConfigNotFound(self.config_path.clone()));
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        parse_config(&content)
    }

    /// `rclone about <remote>: --json`
    pub fn about(&self, remote: &str) -> Result<RemoteUsage> {
        debug!("Querying usage of {}", remote);

        let output = Command::new(&self.binary_path)
            .arg("about")
            .arg(format!("{remote}:"))
            .arg("--json")
            .arg("--config")
            .arg(&self.config_path)
            .output()
            .map_err(|e| SysError::OperationFailed(format!("Failed to execute rclone: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SysError::OperationFailed(format!(
                "rclone about {} failed: {}",
                remote,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            SysError::OperationFailed(format!("Unexpected rclone about output: {}", e))
        })
    }
}

impl RemoteLister for RCloneCli {
    fn list_remotes(&self) -> Vec<String> {
        match self.try_list_remotes() {
            Ok(remotes) => remotes,
            Err(SysError::ConfigNotFound(path)) => {
                debug!("No rclone configuration at {:?}", path);
                Vec::new()
            }
            Err(e) => {
                warn!("Error listing remotes: {}", e);
                Vec::new()
            }
        }
    }

    fn remote_type(&self, remote: &str) -> Option<String> {
        let config = match self.read_config() {
            Ok(config) => config,
            Err(e) => {
                debug!("Cannot read remote type for {}: {}", remote, e);
                return None;
            }
        };
        remote_type_in(&config, remote)
    }

    fn usage(&self, remote: &str) -> Result<RemoteUsage> {
        self.about(remote)
    }
}

impl std::fmt::Debug for RCloneCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RCloneCli")
            .field("binary_path", &self.binary_path)
            .field("config_path", &self.config_path)
            .finish()
    }
}

/// One remote per line, each suffixed with `:`
pub fn parse_listremotes(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim().trim_end_matches(':'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_config(content: &str) -> Result<RemoteConfig> {
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    // rclone section names are case sensitive
    let mut conf = Ini::new_cs();
    conf.read(content.to_string())
        .map_err(|e| SysError::ConfigParse(e.to_string()))?;
    Ok(conf.get_map_ref().clone())
}

fn remote_type_in(config: &RemoteConfig, remote: &str) -> Option<String> {
    config
        .get(remote)
        .and_then(|section| section.get("type"))
        .cloned()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_separator_from_listing() {
        let remotes = parse_listremotes("gdrive:\nMy Box:\n\n  s3:  \n");
        assert_eq!(remotes, vec!["gdrive", "My Box", "s3"]);
        assert!(parse_listremotes("").is_empty());
    }

    #[test]
    fn reads_remote_types() {
        let config = parse_config(
            "[gdrive]\ntype = drive\nscope = drive\n\n[Photos]\ntype = s3\nprovider = AWS\n",
        )
        .expect("parse config");

        assert_eq!(remote_type_in(&config, "gdrive").as_deref(), Some("drive"));
        assert_eq!(remote_type_in(&config, "Photos").as_deref(), Some("s3"));
        assert_eq!(remote_type_in(&config, "photos"), None);
        assert_eq!(remote_type_in(&config, "missing"), None);
    }

    #[test]
    fn empty_config_has_no_remotes() {
        assert!(parse_config("  \n").expect("parse empty").is_empty());
    }

    #[test]
    fn missing_config_lists_nothing() {
        let cli = RCloneCli::with_binary("rclone", "/nonexistent/rclone-tray/rclone.conf");
        assert!(cli.list_remotes().is_empty());
        assert!(matches!(
            cli.try_list_remotes(),
            Err(SysError::ConfigNotFound(_))
        ));
        assert!(cli.remote_type("gdrive").is_none());
    }

    #[test]
    fn failing_command_lists_nothing() {
        let dir = std::env::temp_dir();
        let config = dir.join(format!("rclone-tray-{}-rclone.conf", std::process::id()));
        std::fs::write(&config, "[a]\ntype = local\n").expect("write config");

        // `false` ignores its arguments and exits 1
        let cli = RCloneCli::with_binary("/bin/false", &config);
        assert!(cli.list_remotes().is_empty());
        assert!(cli.about("a").is_err());
        assert_eq!(cli.remote_type("a").as_deref(), Some("local"));

        let _ = std::fs::remove_file(&config);
    }

    #[test]
    fn missing_binary_is_not_found() {
        assert!(matches!(
            RCloneCli::new("/nonexistent/rclone", "/tmp/rclone.conf"),
            Err(SysError::RcloneNotFound)
        ));
    }
}
