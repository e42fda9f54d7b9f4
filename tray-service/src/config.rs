// SPDX-License-Identifier: GPL-3.0-only

//! Tray configuration
//!
//! Every recognised option is a typed field with a default. The file is
//! TOML; `export_json`/`import_json` exchange the same structure as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tray_sys::NetworkOptions;

use crate::error::ConfigError;

const APP_DIR: &str = "rclone-tray";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrayConfig {
    /// rclone executable, looked up in PATH unless absolute
    pub rclone_path: String,

    /// rclone.conf passed to every invocation
    pub rclone_config: PathBuf,

    pub mount: MountSettings,
    pub network: NetworkSettings,
    pub supervision: SupervisionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSettings {
    /// Mount points are `<base_dir>/<remote>`
    pub base_dir: PathBuf,

    /// Extra flags for every mount, whitespace separated
    pub options: String,

    pub mount_on_startup: bool,

    /// Per-remote flags appended after `options`
    pub remotes: BTreeMap<String, RemoteMountSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteMountSettings {
    pub options: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// `0` disables the limit; bare numbers are MB/s
    pub bandwidth_limit: String,
    /// Seconds
    pub timeout: u64,
    pub retries: u32,
    pub low_level_retries: u32,
    /// Bare numbers are MB
    pub buffer_size: String,
    pub transfers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionSettings {
    pub verify_attempts: u32,
    pub verify_interval_ms: u64,
    pub launch_timeout_ms: u64,
    pub terminate_grace_ms: u64,
    /// Finished transfers kept for display
    pub transfer_history: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LoggingLevel,
    pub to_disk: bool,
}

impl Default for TrayConfig {
    fn default() -> Self {
        Self {
            rclone_path: "rclone".to_string(),
            rclone_config: home_dir().join(".config").join("rclone").join("rclone.conf"),
            mount: MountSettings::default(),
            network: NetworkSettings::default(),
            supervision: SupervisionSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            base_dir: home_dir().join("mnt"),
            options: "--vfs-cache-mode=full".to_string(),
            mount_on_startup: false,
            remotes: BTreeMap::new(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bandwidth_limit: "0".to_string(),
            timeout: 30,
            retries: 3,
            low_level_retries: 10,
            buffer_size: "256M".to_string(),
            transfers: 4,
        }
    }
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            verify_attempts: 10,
            verify_interval_ms: 3000,
            launch_timeout_ms: 5000,
            terminate_grace_ms: 5000,
            transfer_history: 100,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LoggingLevel::Info,
            to_disk: true,
        }
    }
}

impl SupervisionSettings {
    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl TrayConfig {
    /// `$XDG_CONFIG_HOME/rclone-tray/config.toml`
    pub fn default_path() -> PathBuf {
        let config_home = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|path| path.is_absolute())
            .unwrap_or_else(|| home_dir().join(".config"));
        config_home.join(APP_DIR).join(CONFIG_FILE)
    }

    /// Load and validate; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn export_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn import_json(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rclone_path.trim().is_empty() {
            return Err(ConfigError::Invalid("rclone_path must not be empty".to_string()));
        }
        if self.mount.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("mount.base_dir must not be empty".to_string()));
        }
        for name in self.mount.remotes.keys() {
            if !is_valid_remote_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "mount.remotes: invalid remote name {name:?}"
                )));
            }
        }
        if self.network.transfers == 0 {
            return Err(ConfigError::Invalid("network.transfers must be at least 1".to_string()));
        }
        if self.network.timeout == 0 {
            return Err(ConfigError::Invalid("network.timeout must not be 0".to_string()));
        }

        let supervision = &self.supervision;
        if supervision.verify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "supervision.verify_attempts must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("verify_interval_ms", supervision.verify_interval_ms),
            ("launch_timeout_ms", supervision.launch_timeout_ms),
            ("terminate_grace_ms", supervision.terminate_grace_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "supervision.{name} must not be 0"
                )));
            }
        }
        Ok(())
    }

    pub fn mount_point(&self, remote: &str) -> PathBuf {
        self.mount.base_dir.join(remote)
    }

    /// Base options followed by the remote's own
    pub fn mount_options_for(&self, remote: &str) -> Vec<String> {
        let mut options: Vec<String> = self
            .mount
            .options
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if let Some(extra) = self.mount.remotes.get(remote) {
            options.extend(extra.options.split_whitespace().map(str::to_string));
        }
        options
    }

    pub fn network_options(&self) -> NetworkOptions {
        NetworkOptions {
            bandwidth_limit: self.network.bandwidth_limit.clone(),
            timeout_secs: self.network.timeout,
            retries: self.network.retries,
            low_level_retries: self.network.low_level_retries,
            buffer_size: self.network.buffer_size.clone(),
            transfers: self.network.transfers,
        }
    }

    fn expand_paths(&mut self) {
        self.rclone_config = expand_home(&self.rclone_config);
        self.mount.base_dir = expand_home(&self.mount.base_dir);
    }
}

/// Remote names end up as a path component and before a `:`
pub fn is_valid_remote_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains(':')
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(1);

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "rclone-tray-config-{}-{unique}",
                std::process::id()
            ));
            fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = TrayConfig::from_toml("").expect("parse empty");
        assert_eq!(config.supervision.verify_attempts, 10);
        assert_eq!(config.supervision.verify_interval(), Duration::from_secs(3));
        assert_eq!(config.network.buffer_size, "256M");
        assert_eq!(config.mount.options, "--vfs-cache-mode=full");
        assert!(config.mount.base_dir.ends_with("mnt"));
    }

    #[test]
    fn parses_sections_and_overrides() {
        let config = TrayConfig::from_toml(
            r#"
rclone_config = "/etc/rclone.conf"

[mount]
base_dir = "/srv/clouds"
options = "--vfs-cache-mode=writes --allow-other"

[mount.remotes.gdrive]
options = "--drive-shared-with-me"

[network]
bandwidth_limit = "10"
timeout = 60

[logging]
level = "debug"
"#,
        )
        .expect("parse config");

        assert_eq!(config.mount_point("gdrive"), PathBuf::from("/srv/clouds/gdrive"));
        assert_eq!(
            config.mount_options_for("gdrive"),
            vec![
                "--vfs-cache-mode=writes",
                "--allow-other",
                "--drive-shared-with-me"
            ]
        );
        assert_eq!(config.mount_options_for("box").len(), 2);
        assert_eq!(config.network_options().bandwidth_limit, "10");
        assert_eq!(config.network_options().timeout_secs, 60);
        assert_eq!(config.network.retries, 3);
        assert_eq!(config.logging.level, LoggingLevel::Debug);
    }

    #[test]
    fn expands_home_prefix() {
        let config = TrayConfig::from_toml("[mount]\nbase_dir = \"~/clouds\"\n").expect("parse");
        assert!(config.mount.base_dir.is_absolute());
        assert!(config.mount.base_dir.ends_with("clouds"));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = TrayConfig::from_toml("[supervision]\nverify_attempts = 0\n")
            .expect_err("zero attempts");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = TrayConfig::from_toml("[mount.remotes.\"a/b\"]\noptions = \"\"\n")
            .expect_err("slash in remote");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = TrayConfig::from_toml("rclone_path = \"\"\n").expect_err("empty path");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = TrayConfig::from_toml("[network]\ntimeout = \"soon\"\n").expect_err("type");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn remote_name_rules() {
        assert!(is_valid_remote_name("gdrive"));
        assert!(is_valid_remote_name("My Box"));
        assert!(!is_valid_remote_name(""));
        assert!(!is_valid_remote_name(".."));
        assert!(!is_valid_remote_name("a:b"));
    }

    #[test]
    fn save_load_and_json_exchange() {
        let temp = TempDir::new();
        let mut config = TrayConfig::default();
        config.network.bandwidth_limit = "5M".to_string();
        config.mount.remotes.insert(
            "gdrive".to_string(),
            RemoteMountSettings {
                options: "--read-only".to_string(),
            },
        );

        let toml_path = temp.path.join("nested").join("config.toml");
        config.save(&toml_path).expect("save toml");
        assert_eq!(TrayConfig::load(&toml_path).expect("load toml"), config);

        let json_path = temp.path.join("export.json");
        config.export_json(&json_path).expect("export json");
        assert_eq!(TrayConfig::import_json(&json_path).expect("import json"), config);

        assert_eq!(
            TrayConfig::load(&temp.path.join("missing.toml")).expect("defaults"),
            TrayConfig::default()
        );
    }
}
