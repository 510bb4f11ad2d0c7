//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::barrier::BarrierScope;
use crate::error::{Error, Result};
use crate::types::TimeFrame;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "beacon";

/// `$<var>/beacon`, falling back to `<home>/<fallback>/beacon`.
///
/// An empty or relative variable is ignored, as XDG requires.
fn xdg_app_dir(var: &str, fallback: &str) -> PathBuf {
    let base = std::env::var_os(var)
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(fallback)
        });
    base.join(APP_DIR)
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Queue size and age bounds
    #[serde(default)]
    pub queue: QueueConfig,

    /// Barrier settings keyed by barrier id (`batching`, `connectivity`, ...)
    #[serde(default)]
    pub barriers: HashMap<String, BarrierSettings>,

    /// Connectivity inference tuning
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Barrier coordinator tuning
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// HTTP collect dispatcher (optional)
    #[serde(default)]
    pub collect: CollectConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Also write compact logs to stderr
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Queue bounds, globally and per dispatcher.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum pending entries per dispatcher
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Maximum age of a pending entry
    #[serde(default = "default_expiration")]
    pub expiration: TimeFrame,

    /// Per-dispatcher overrides
    #[serde(default)]
    pub dispatchers: HashMap<String, QueueBound>,
}

/// Per-dispatcher override of the global queue bounds.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueueBound {
    pub max_queue_size: Option<usize>,
    pub expiration: Option<TimeFrame>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            expiration: default_expiration(),
            dispatchers: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Maximum pending entries for one dispatcher
    pub fn max_queue_size_for(&self, dispatcher_id: &str) -> usize {
        self.dispatchers
            .get(dispatcher_id)
            .and_then(|bound| bound.max_queue_size)
            .unwrap_or(self.max_queue_size)
    }

    /// Maximum entry age for one dispatcher
    pub fn expiration_for(&self, dispatcher_id: &str) -> TimeFrame {
        self.dispatchers
            .get(dispatcher_id)
            .and_then(|bound| bound.expiration)
            .unwrap_or(self.expiration)
    }
}

fn default_max_queue_size() -> usize {
    100
}

fn default_expiration() -> TimeFrame {
    TimeFrame::days(1)
}

/// Settings for one barrier: where it applies and its free-form configuration.
///
/// ```toml
/// [barriers.batching]
/// scopes = ["collect"]
/// batch_size = 5
/// ```
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct BarrierSettings {
    /// Explicit scopes; `None` means the barrier factory's defaults
    #[serde(default)]
    pub scopes: Option<Vec<BarrierScope>>,

    /// Remaining keys, interpreted by the barrier itself
    #[serde(flatten)]
    pub configuration: Map<String, Value>,
}

/// Connectivity inference configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// First backoff interval after a failed request
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the backoff interval
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How many times the network client retries a retryable failure
    #[serde(default = "default_retry_limit")]
    pub retry_limit: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_limit: default_retry_limit(),
        }
    }
}

impl ConnectivityConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_retry_limit() -> usize {
    3
}

/// Barrier coordinator configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CoordinatorConfig {
    /// Quiet period before a recomputed barrier state is published
    #[serde(default)]
    pub settle_ms: u64,
}

impl CoordinatorConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Collect dispatcher configuration
///
/// When enabled, dispatches are POSTed in batches to `url`.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectConfig {
    /// Enable/disable the collect dispatcher
    #[serde(default)]
    pub enabled: bool,

    /// Collection endpoint (e.g., `https://collect.example.com/events`)
    pub url: Option<String>,

    /// Dispatches per request (max 50, default 10)
    #[serde(default = "default_dispatch_limit")]
    pub dispatch_limit: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_collect_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_collect_max_retries")]
    pub max_retries: usize,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            dispatch_limit: default_dispatch_limit(),
            timeout_secs: default_collect_timeout(),
            max_retries: default_collect_max_retries(),
        }
    }
}

impl CollectConfig {
    /// Check if the collect dispatcher is enabled and has an endpoint
    pub fn is_ready(&self) -> bool {
        self.enabled && self.url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.url.is_none() {
            return Err(Error::Config(
                "collect.url is required when collect is enabled".to_string(),
            ));
        }
        if self.dispatch_limit == 0 || self.dispatch_limit > 50 {
            return Err(Error::Config(
                "collect.dispatch_limit must be between 1 and 50".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_dispatch_limit() -> usize {
    10
}

fn default_collect_timeout() -> u64 {
    30
}

fn default_collect_max_retries() -> usize {
    3
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.collect.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_app_dir("XDG_CONFIG_HOME", ".config").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite queue)
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_app_dir("XDG_DATA_HOME", ".local/share")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_app_dir("XDG_STATE_HOME", ".local/state")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/beacon/queue.db` (~/.local/share/beacon/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }
}
