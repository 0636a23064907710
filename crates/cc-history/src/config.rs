//! Configuration for cc-history.
//!
//! # Configuration Location
//!
//! By default, configuration is stored at `~/.cc-history/config.toml`.
//! This can be overridden with the `CC_HISTORY_CONFIG_PATH` environment variable.
//!
//! # Directory Structure
//!
//! ```text
//! ~/.cc-history/
//! ├── config.toml          # Configuration
//! ├── logs/                # Daemon log files
//! └── run/                 # Daemon PID and status files
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cc_history::config::HistoryConfig;
//!
//! # async fn example() -> cc_history::Result<()> {
//! let mut config = HistoryConfig::load_or_default().await?;
//! config.set_value("layout", "flat")?;
//! config.save().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{HistoryError, Result};
use crate::paths::GlobalLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the state directory under the home directory.
pub const STATE_DIR: &str = ".cc-history";

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "CC_HISTORY_CONFIG_PATH";
pub const ENV_GLOBAL_PATH: &str = "CC_HISTORY_GLOBAL_PATH";
pub const ENV_MODE: &str = "CC_HISTORY_MODE";
pub const ENV_LOG_LEVEL: &str = "CC_HISTORY_LOG_LEVEL";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Where conversation history is meant to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// Global store only; local mirroring is declined unless forced.
    Global,
    /// Mirror global → local only.
    Local,
    /// Mirror both ways.
    #[default]
    Hybrid,
}

impl HistoryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether syncs and watches push local changes back by default.
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, Self::Hybrid)
    }

    pub fn mirrors_locally(&self) -> bool {
        !matches!(self, Self::Global)
    }
}

impl std::str::FromStr for HistoryMode {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "local" => Ok(Self::Local),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(HistoryError::config(format!(
                "Invalid mode '{}'. Must be one of: global, local, hybrid",
                s
            ))),
        }
    }
}

impl std::fmt::Display for HistoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watch timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Quiet period before a burst of changes is synced
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    /// Use the polling backend (slow or networked filesystems)
    pub use_polling: bool,
    pub channel_capacity: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            poll_interval_ms: 1000,
            use_polling: false,
            channel_capacity: 256,
        }
    }
}

/// Multi-project daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Directories searched for projects; empty means the home directory
    pub search_roots: Vec<PathBuf>,
    /// Deepest project root below a search root
    pub max_depth: usize,
    /// Minimum time between two syncs of the same project
    pub cooldown_secs: u64,
    /// Pick up projects initialized after the daemon started
    pub watch_search_roots: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            search_roots: Vec::new(),
            max_depth: 4,
            cooldown_secs: 5,
            watch_search_roots: true,
        }
    }
}

impl DaemonSettings {
    /// Configured search roots, or the home directory when none are set.
    pub fn effective_search_roots(&self) -> Vec<PathBuf> {
        if !self.search_roots.is_empty() {
            return self.search_roots.clone();
        }
        dirs::home_dir().into_iter().collect()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub mode: HistoryMode,

    /// Overrides the global store root (`~/.claude`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_path: Option<PathBuf>,

    pub layout: GlobalLayout,

    /// Run a sync right after `init`
    pub auto_sync: bool,

    /// Add `ignore_patterns` to `.gitignore` on `init`
    pub auto_ignore: bool,

    pub ignore_patterns: Vec<String>,

    pub log_level: String,

    pub watcher: WatcherSettings,

    pub daemon: DaemonSettings,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            mode: HistoryMode::default(),
            global_path: None,
            layout: GlobalLayout::default(),
            auto_sync: true,
            auto_ignore: false,
            ignore_patterns: vec![".claude/history/".to_string()],
            log_level: "info".to_string(),
            watcher: WatcherSettings::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

/// Keys accepted by [`HistoryConfig::get_value`] and [`HistoryConfig::set_value`].
pub const CONFIG_KEYS: &[&str] = &[
    "mode",
    "global_path",
    "layout",
    "auto_sync",
    "auto_ignore",
    "ignore_patterns",
    "log_level",
    "watcher.settle_ms",
    "watcher.poll_interval_ms",
    "watcher.use_polling",
    "watcher.channel_capacity",
    "daemon.search_roots",
    "daemon.max_depth",
    "daemon.cooldown_secs",
    "daemon.watch_search_roots",
];

impl HistoryConfig {
    /// Load configuration from the default location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path).await
    }

    /// Load configuration from the default location, or defaults when no file exists
    pub async fn load_or_default() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path_or_default(&config_path).await
    }

    /// Load configuration from `path`, or defaults (with environment overrides)
    /// when the file does not exist
    pub async fn load_from_path_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_path(path).await
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            let mut config = Self::default();
            config.merge_env_vars()?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HistoryError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: Self = toml::from_str(&content)?;

        config.merge_env_vars()?;
        config.validate()?;

        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Save configuration to the default location
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to_path(&config_path).await
    }

    /// Save configuration to a specific path atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or cannot be written
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    HistoryError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| HistoryError::config(format!("Failed to serialize config: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");

        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| HistoryError::config(format!("Failed to write config file: {}", e)))?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| HistoryError::config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(HistoryError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.watcher.channel_capacity == 0 {
            return Err(HistoryError::config(
                "watcher.channel_capacity must be greater than 0",
            ));
        }

        if self.watcher.poll_interval_ms == 0 {
            return Err(HistoryError::config(
                "watcher.poll_interval_ms must be greater than 0",
            ));
        }

        if self.ignore_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(HistoryError::config("ignore_patterns must not contain empty entries"));
        }

        if let Some(path) = &self.global_path {
            if path.as_os_str().is_empty() {
                return Err(HistoryError::config("global_path must not be empty"));
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_from(|key| std::env::var(key).ok())
    }

    /// Merge overrides from an arbitrary variable lookup
    pub fn merge_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_GLOBAL_PATH) {
            debug!("Overriding global_path from environment: {}", path);
            self.global_path = Some(PathBuf::from(path));
        }

        if let Some(mode) = lookup(ENV_MODE) {
            debug!("Overriding mode from environment: {}", mode);
            self.mode = mode.parse()?;
        }

        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", log_level);
            self.log_level = log_level;
        }

        Ok(())
    }

    /// `~/.cc-history`
    pub fn base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(STATE_DIR))
            .ok_or_else(|| HistoryError::config("Could not determine home directory"))
    }

    /// Config file path, honoring `CC_HISTORY_CONFIG_PATH`
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Daemon log directory
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Daemon PID and status directory
    pub fn run_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("run"))
    }

    /// Read one setting as a string.
    pub fn get_value(&self, key: &str) -> Result<String> {
        let value = match key {
            "mode" => self.mode.to_string(),
            "global_path" => self
                .global_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "layout" => self.layout.to_string(),
            "auto_sync" => self.auto_sync.to_string(),
            "auto_ignore" => self.auto_ignore.to_string(),
            "ignore_patterns" => self.ignore_patterns.join(","),
            "log_level" => self.log_level.clone(),
            "watcher.settle_ms" => self.watcher.settle_ms.to_string(),
            "watcher.poll_interval_ms" => self.watcher.poll_interval_ms.to_string(),
            "watcher.use_polling" => self.watcher.use_polling.to_string(),
            "watcher.channel_capacity" => self.watcher.channel_capacity.to_string(),
            "daemon.search_roots" => self
                .daemon
                .search_roots
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
            "daemon.max_depth" => self.daemon.max_depth.to_string(),
            "daemon.cooldown_secs" => self.daemon.cooldown_secs.to_string(),
            "daemon.watch_search_roots" => self.daemon.watch_search_roots.to_string(),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Update one setting from a string. The result is validated.
    ///
    /// List values are comma separated; an empty `global_path` clears the override.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "mode" => updated.mode = value.parse()?,
            "global_path" => {
                updated.global_path = (!value.trim().is_empty()).then(|| PathBuf::from(value));
            }
            "layout" => updated.layout = value.parse()?,
            "auto_sync" => updated.auto_sync = parse_value(key, value)?,
            "auto_ignore" => updated.auto_ignore = parse_value(key, value)?,
            "ignore_patterns" => updated.ignore_patterns = split_list(value),
            "log_level" => updated.log_level = value.to_lowercase(),
            "watcher.settle_ms" => updated.watcher.settle_ms = parse_value(key, value)?,
            "watcher.poll_interval_ms" => {
                updated.watcher.poll_interval_ms = parse_value(key, value)?
            }
            "watcher.use_polling" => updated.watcher.use_polling = parse_value(key, value)?,
            "watcher.channel_capacity" => {
                updated.watcher.channel_capacity = parse_value(key, value)?
            }
            "daemon.search_roots" => {
                updated.daemon.search_roots =
                    split_list(value).into_iter().map(PathBuf::from).collect();
            }
            "daemon.max_depth" => updated.daemon.max_depth = parse_value(key, value)?,
            "daemon.cooldown_secs" => updated.daemon.cooldown_secs = parse_value(key, value)?,
            "daemon.watch_search_roots" => {
                updated.daemon.watch_search_roots = parse_value(key, value)?
            }
            _ => return Err(unknown_key(key)),
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Keys accepted by [`get_value`](Self::get_value) and [`set_value`](Self::set_value).
    pub fn keys() -> &'static [&'static str] {
        CONFIG_KEYS
    }

    /// Every key with its current value, in [`CONFIG_KEYS`] order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        Self::keys()
            .iter()
            .filter_map(|key| self.get_value(key).ok().map(|value| (*key, value)))
            .collect()
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| HistoryError::config(format!("Invalid value '{}' for {}: {}", value, key, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn unknown_key(key: &str) -> HistoryError {
    HistoryError::config(format!(
        "Unknown configuration key '{}'. Valid keys: {}",
        key,
        CONFIG_KEYS.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn create_temp_config_env() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        (temp_dir, config_path)
    }

    #[test]
    fn test_default_config() {
        let config = HistoryConfig::default();
        assert_eq!(config.mode, HistoryMode::Hybrid);
        assert_eq!(config.layout, GlobalLayout::PerProject);
        assert_eq!(config.ignore_patterns, vec![".claude/history/"]);
        assert_eq!(config.watcher.settle_ms, 2000);
        assert_eq!(config.daemon.max_depth, 4);
        assert!(!config.auto_ignore);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HistoryConfig::default();

        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
        config.log_level = "info".to_string();

        config.watcher.channel_capacity = 0;
        assert!(config.validate().is_err());
        config.watcher.channel_capacity = 16;

        config.ignore_patterns.push("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_config() {
        let (_temp_dir, config_path) = create_temp_config_env();

        let mut config = HistoryConfig::default();
        config.layout = GlobalLayout::Flat;
        config.global_path = Some(PathBuf::from("/srv/claude"));
        config.daemon.search_roots = vec![PathBuf::from("/work")];

        config.save_to_path(&config_path).await.unwrap();
        assert!(config_path.exists());
        assert!(!config_path.with_extension("toml.tmp").exists());

        let loaded = HistoryConfig::load_from_path(&config_path).await.unwrap();
        assert_eq!(loaded.layout, GlobalLayout::Flat);
        assert_eq!(loaded.daemon.search_roots, vec![PathBuf::from("/work")]);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let (_temp_dir, config_path) = create_temp_config_env();
        std::fs::write(&config_path, "layout = \"flat\"\n[watcher]\nsettle_ms = 500\n").unwrap();

        let loaded = HistoryConfig::load_from_path(&config_path).await.unwrap();
        assert_eq!(loaded.layout, GlobalLayout::Flat);
        assert_eq!(loaded.watcher.settle_ms, 500);
        assert_eq!(loaded.watcher.channel_capacity, 256);
        assert_eq!(loaded.daemon.cooldown_secs, 5);
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let (_temp_dir, config_path) = create_temp_config_env();
        std::fs::write(&config_path, "layout = \"nested\"\n").unwrap();
        assert!(HistoryConfig::load_from_path(&config_path).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let (_temp_dir, config_path) = create_temp_config_env();
        let config = HistoryConfig::load_from_path_or_default(&config_path)
            .await
            .unwrap();
        assert_eq!(config.layout, GlobalLayout::PerProject);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_GLOBAL_PATH, "/tmp/claude"),
            (ENV_MODE, "local"),
            (ENV_LOG_LEVEL, "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = HistoryConfig::default();
        config
            .merge_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.global_path, Some(PathBuf::from("/tmp/claude")));
        assert_eq!(config.mode, HistoryMode::Local);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_env_mode() {
        let mut config = HistoryConfig::default();
        let result = config.merge_env_from(|key| (key == ENV_MODE).then(|| "both".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_get_and_set_values() {
        let mut config = HistoryConfig::default();

        config.set_value("mode", "global").unwrap();
        assert_eq!(config.get_value("mode").unwrap(), "global");

        config.set_value("daemon.max_depth", "2").unwrap();
        assert_eq!(config.daemon.max_depth, 2);

        config
            .set_value("ignore_patterns", ".claude/history/, .claude/*.log")
            .unwrap();
        assert_eq!(config.ignore_patterns.len(), 2);

        config.set_value("global_path", "/srv/claude").unwrap();
        assert_eq!(config.get_value("global_path").unwrap(), "/srv/claude");
        config.set_value("global_path", "").unwrap();
        assert!(config.global_path.is_none());

        assert!(config.set_value("daemon.max_depth", "deep").is_err());
        assert!(config.set_value("nope", "1").is_err());
        assert!(config.get_value("nope").is_err());

        // A rejected value leaves the config untouched
        assert!(config.set_value("watcher.channel_capacity", "0").is_err());
        assert_eq!(config.watcher.channel_capacity, 256);
    }

    #[test]
    fn test_entries_cover_every_key() {
        let config = HistoryConfig::default();
        assert_eq!(config.entries().len(), CONFIG_KEYS.len());
    }

    #[test]
    fn test_mode_semantics() {
        assert!(HistoryMode::Hybrid.is_bidirectional());
        assert!(!HistoryMode::Local.is_bidirectional());
        assert!(!HistoryMode::Global.mirrors_locally());
        assert_eq!("HYBRID".parse::<HistoryMode>().unwrap(), HistoryMode::Hybrid);
    }
}
