//! Configuration loaded from `~/.pushclock/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PushclockError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushclockConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// IANA zone used for cron evaluation and template rendering.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub hooks: HookRunnerConfig,
}

fn default_database_path() -> String { "~/.pushclock/pushclock.db".into() }
fn default_timezone() -> String { "Asia/Shanghai".into() }
fn default_log_level() -> String { "info".into() }

impl Default for PushclockConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            timezone: default_timezone(),
            log_level: default_log_level(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            hooks: HookRunnerConfig::default(),
        }
    }
}

impl PushclockConfig {
    /// Load from the default path, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PushclockError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PushclockError::Config(format!("Failed to parse config: {e}")))?;
        config.time_zone()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PushclockError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pushclock")
    }

    /// Parsed `timezone`.
    pub fn time_zone(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| PushclockError::Config(format!("Unknown timezone '{}'", self.timezone)))
    }
}

/// Job engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running firings.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Window in which a started/successful entry makes a new firing a duplicate. 0 disables.
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Per-listener buffer of the event broadcaster.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Max due jobs claimed per tick.
    #[serde(default = "default_due_batch")]
    pub due_batch: usize,
}

fn default_workers() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_duplicate_window_secs() -> u64 { 3 }
fn default_shutdown_grace_secs() -> u64 { 30 }
fn default_event_buffer() -> usize { 10 }
fn default_due_batch() -> usize { 64 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            duplicate_window_secs: default_duplicate_window_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            event_buffer: default_event_buffer(),
            due_batch: default_due_batch(),
        }
    }
}

/// Outbound HTTP settings for channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_dispatch_timeout() -> u64 { 10 }
fn default_user_agent() -> String { format!("pushclock/{}", env!("CARGO_PKG_VERSION")) }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Hook subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRunnerConfig {
    #[serde(default = "default_hook_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    #[serde(default = "default_shell_bin")]
    pub shell_bin: String,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_max_script_snapshot_chars")]
    pub max_script_snapshot_chars: usize,
}

fn default_hook_timeout() -> u64 { 30 }
fn default_python_bin() -> String { "python3".into() }
fn default_shell_bin() -> String { "bash".into() }
fn default_max_output_chars() -> usize { 10_000 }
fn default_max_script_snapshot_chars() -> usize { 5_000 }

impl Default for HookRunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_hook_timeout(),
            python_bin: default_python_bin(),
            shell_bin: default_shell_bin(),
            max_output_chars: default_max_output_chars(),
            max_script_snapshot_chars: default_max_script_snapshot_chars(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PushclockConfig::default();
        assert_eq!(config.timezone, "Asia/Shanghai");
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.scheduler.duplicate_window_secs, 3);
        assert_eq!(config.hooks.default_timeout_secs, 30);
        assert_eq!(config.dispatch.timeout_secs, 10);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            database_path = "/tmp/pc.db"
            timezone = "UTC"

            [scheduler]
            workers = 8
            poll_interval_ms = 100

            [hooks]
            python_bin = "python3.12"
        "#;

        let config: PushclockConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, "/tmp/pc.db");
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.event_buffer, 10);
        assert_eq!(config.hooks.python_bin, "python3.12");
        assert_eq!(config.time_zone().unwrap(), chrono_tz::UTC);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: PushclockConfig = toml::from_str("").unwrap();
        assert_eq!(config.database_path, "~/.pushclock/pushclock.db");
        assert_eq!(config.hooks.shell_bin, "bash");
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let config = PushclockConfig {
            timezone: "Mars/Olympus".into(),
            ..Default::default()
        };
        assert!(matches!(config.time_zone(), Err(PushclockError::Config(_))));
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = std::env::temp_dir().join(format!("pushclock-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = PushclockConfig::default();
        config.scheduler.workers = 2;
        config.save_to(&path).unwrap();
        let loaded = PushclockConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.workers, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = PushclockConfig::home_dir();
        assert!(home.to_string_lossy().contains("pushclock"));
    }
}
