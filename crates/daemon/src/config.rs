//! Configuration management for Shellward.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellward/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("default_shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("creation_cooldown_ms must be at most 10000, got {0}")]
    InvalidCreationCooldown(u64),

    #[error("connect_timeout must be between 1 and 300 seconds, got {0}")]
    InvalidConnectTimeout(u64),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for the creation cooldown.
const MAX_CREATION_COOLDOWN_MS: u64 = 10_000;

/// Main configuration structure for Shellward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General configuration.
    pub daemon: DaemonConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// SSH client configuration.
    pub ssh: SshConfig,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for logs and the known hosts file.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for local sessions. Falls back to `$SHELL`, then `/bin/sh`.
    pub default_shell: Option<String>,

    /// Start local shells as login shells (`-l`).
    pub login_shell: bool,

    /// Minimum time between two session creations.
    pub creation_cooldown_ms: u64,

    /// Time a terminated process gets before it is killed.
    pub kill_grace_ms: u64,

    /// Derive titles from OSC 7 directory announcements.
    pub osc7_tracking: bool,

    /// Install a temporary zsh hook that announces the directory.
    pub zsh_integration: bool,
}

/// SSH client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// SSH client program.
    pub program: String,

    /// Helper used to supply stored passwords.
    pub password_helper: String,

    /// `ConnectTimeout` in seconds.
    pub connect_timeout: u64,

    /// `ServerAliveInterval` in seconds.
    pub server_alive_interval: u64,

    /// `ServerAliveCountMax`.
    pub server_alive_count_max: u32,

    /// `ControlPersist` in seconds, 0 disables it.
    pub control_persist: u64,

    /// Directory for ControlMaster sockets.
    pub control_dir: PathBuf,

    /// Known hosts file. Defaults to `<data_dir>/known_hosts`.
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            login_shell: true,
            creation_cooldown_ms: 300,
            kill_grace_ms: 5000,
            osc7_tracking: true,
            zsh_integration: true,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            password_helper: "sshpass".to_string(),
            connect_timeout: 30,
            server_alive_interval: 30,
            server_alive_count_max: 3,
            control_persist: 600,
            control_dir: default_control_dir(),
            known_hosts_file: None,
        }
    }
}

impl SessionConfig {
    pub fn creation_cooldown(&self) -> Duration {
        Duration::from_millis(self.creation_cooldown_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellward")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellward")
}

/// Returns the default ControlMaster socket directory.
fn default_control_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shellward")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLWARD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLWARD_SHELL: Override the local shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHELLWARD_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("SHELLWARD_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = Some(shell);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(shell) = &self.session.default_shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.session.creation_cooldown_ms > MAX_CREATION_COOLDOWN_MS {
            return Err(ConfigError::InvalidCreationCooldown(
                self.session.creation_cooldown_ms,
            ));
        }

        if !(1..=300).contains(&self.ssh.connect_timeout) {
            return Err(ConfigError::InvalidConnectTimeout(self.ssh.connect_timeout));
        }

        Ok(())
    }

    /// The known hosts file used for SSH sessions.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.ssh
            .known_hosts_file
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("known_hosts"))
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.session.default_shell, None);
        assert!(config.session.login_shell);
        assert_eq!(config.session.creation_cooldown_ms, 300);
        assert_eq!(config.session.kill_grace_ms, 5000);
        assert!(config.session.osc7_tracking);
        assert_eq!(config.ssh.program, "ssh");
        assert_eq!(config.ssh.connect_timeout, 30);
        assert_eq!(config.ssh.server_alive_interval, 30);
        assert_eq!(config.ssh.server_alive_count_max, 3);
        assert_eq!(config.ssh.control_persist, 600);
    }

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert!(config.daemon.data_dir.to_string_lossy().contains("shellward"));
        assert!(config.ssh.control_dir.to_string_lossy().contains("shellward"));
        assert_eq!(
            config.known_hosts_path(),
            config.daemon.data_dir.join("known_hosts")
        );
        assert!(config.log_dir().ends_with("logs"));
    }

    #[test]
    fn test_durations() {
        let config = SessionConfig::default();
        assert_eq!(config.creation_cooldown(), Duration::from_millis(300));
        assert_eq!(config.kill_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[ssh]
control_persist = 0
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.ssh.control_persist, 0);
        assert_eq!(config.ssh.connect_timeout, 30);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[session]
default_shell = "/bin/zsh"
login_shell = false
creation_cooldown_ms = 500
kill_grace_ms = 1000
osc7_tracking = false
zsh_integration = false

[ssh]
program = "/usr/local/bin/ssh"
password_helper = "sshpass"
connect_timeout = 10
server_alive_interval = 15
server_alive_count_max = 5
control_persist = 60
control_dir = "/tmp/sockets"
known_hosts_file = "/etc/ssh/known"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/zsh"));
        assert!(!config.session.login_shell);
        assert_eq!(config.session.kill_grace_ms, 1000);
        assert!(!config.session.zsh_integration);
        assert_eq!(config.ssh.program, "/usr/local/bin/ssh");
        assert_eq!(config.ssh.server_alive_count_max, 5);
        assert_eq!(config.ssh.control_dir, PathBuf::from("/tmp/sockets"));
        assert_eq!(config.known_hosts_path(), PathBuf::from("/etc/ssh/known"));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
kill_grace_ms = "soon"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
future_option = true

[unknown_section]
value = 1
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.session.default_shell = Some("/bin/bash".to_string());
        original.ssh.known_hosts_file = Some(PathBuf::from("/tmp/kh"));

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[ssh]"));

        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.session.creation_cooldown_ms = 50;
        original.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[session]\nlogin_shell = 3").unwrap();

        let err = format!("{:#}", Config::load(&config_path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("shellward/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("SHELLWARD_SHELL");
        std::env::set_var("SHELLWARD_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("SHELLWARD_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_shell() {
        std::env::remove_var("SHELLWARD_LOG_LEVEL");
        std::env::set_var("SHELLWARD_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/sh"));

        std::env::remove_var("SHELLWARD_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLWARD_LOG_LEVEL", "");
        std::env::set_var("SHELLWARD_SHELL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("SHELLWARD_LOG_LEVEL");
        std::env::remove_var("SHELLWARD_SHELL");
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_shell_path() {
        let mut config = Config::default();
        config.session.default_shell = Some("/bin/sh".to_string());
        assert!(config.validate().is_ok());

        config.session.default_shell = Some("sh".to_string());
        assert!(config.validate().is_ok());

        config.session.default_shell = Some("/nonexistent/shell".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.session.default_shell = Some("definitely-not-a-shell-xyz".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cooldown() {
        let mut config = Config::default();
        config.session.creation_cooldown_ms = 0;
        assert!(config.validate().is_ok());

        config.session.creation_cooldown_ms = 10_000;
        assert!(config.validate().is_ok());

        config.session.creation_cooldown_ms = 10_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCreationCooldown(10_001))
        );
    }

    #[test]
    fn test_validate_connect_timeout() {
        let mut config = Config::default();
        config.ssh.connect_timeout = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(0)));

        config.ssh.connect_timeout = 300;
        assert!(config.validate().is_ok());

        config.ssh.connect_timeout = 301;
        assert!(config.validate().is_err());
    }
}
