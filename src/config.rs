//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `CHRONOSHELF_*` environment overrides.

use crate::lock::{default_lock_key, DEFAULT_LOCK_TIMEOUT, LOCK_BACKENDS, MAX_LOCK_TIMEOUT};
use crate::notify::{HttpNotifierConfig, NOTIFY_BACKENDS};
use crate::state::STATE_BACKENDS;
use crate::storage::partition::{PartitionStrategyFactory, DEFAULT_PARTITION_STRATEGY};
use crate::storage::store::{PLUGIN_LOCAL, PLUGIN_MEMORY, PLUGIN_S3};
use crate::storage::{parse_compression, EmptyBatchPolicy, LoaderConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub load: LoadConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub notification: NotificationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("chronoshelf"))
        .unwrap_or_else(|| PathBuf::from("./chronoshelf_data"))
}

/// Versioned loader configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    /// `s3_versioned`, `local_versioned` or `memory_versioned`
    #[serde(default = "default_plugin")]
    pub plugin: String,

    /// Bucket name (required by `s3_versioned`)
    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    /// Root directory for `local_versioned`
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    #[serde(default = "default_partition_strategy")]
    pub partition_strategy: String,

    #[serde(default = "default_compression")]
    pub compression: String,

    #[serde(default)]
    pub max_rows_per_file: Option<usize>,

    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,

    #[serde(default)]
    pub empty_batch: EmptyBatchPolicy,
}

fn default_plugin() -> String {
    PLUGIN_LOCAL.to_string()
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

fn default_local_root() -> PathBuf {
    default_data_dir().join("store")
}

fn default_partition_strategy() -> String {
    DEFAULT_PARTITION_STRATEGY.to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_write_concurrency() -> usize {
    4
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            bucket: None,
            aws_region: default_aws_region(),
            local_root: default_local_root(),
            partition_strategy: default_partition_strategy(),
            compression: default_compression(),
            max_rows_per_file: None,
            write_concurrency: default_write_concurrency(),
            empty_batch: EmptyBatchPolicy::default(),
        }
    }
}

impl LoadConfig {
    /// Bucket reported in notifications: the S3 bucket, or the local root
    pub fn bucket_label(&self) -> String {
        match &self.bucket {
            Some(bucket) => bucket.clone(),
            None => self.local_root.to_string_lossy().to_string(),
        }
    }

    pub fn loader_config(&self, retry: RetryPolicy) -> LoaderConfig {
        LoaderConfig {
            partition_strategy: Some(self.partition_strategy.clone()),
            compression: self.compression.clone(),
            max_rows_per_file: self.max_rows_per_file,
            write_concurrency: self.write_concurrency,
            empty_batch: self.empty_batch,
            retry,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    /// `memory`, `file` or `object_store`
    #[serde(default = "default_lock_backend")]
    pub backend: String,

    /// Fixed lock key; `etl:{dataset_id}` when unset
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_lock_timeout")]
    pub timeout_seconds: u64,

    /// Lock file directory for the `file` backend
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
}

fn default_lock_backend() -> String {
    "file".to_string()
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_secs()
}

fn default_lock_dir() -> PathBuf {
    default_data_dir().join("locks")
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_lock_backend(),
            key: None,
            timeout_seconds: default_lock_timeout(),
            dir: default_lock_dir(),
        }
    }
}

impl LockConfig {
    pub fn lock_key(&self, dataset_id: &str) -> String {
        self.key
            .clone()
            .unwrap_or_else(|| default_lock_key(dataset_id))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Incremental state configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// `none`, `file` or `object_store`
    #[serde(default = "default_state_backend")]
    pub backend: String,

    /// Directory for the `file` backend
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_backend() -> String {
    "file".to_string()
}

fn default_state_dir() -> PathBuf {
    default_data_dir().join("state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            dir: default_state_dir(),
        }
    }
}

/// Object store retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

/// Projection notification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// `none`, `log` or `http`
    #[serde(default = "default_notification_backend")]
    pub backend: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_notify_retries")]
    pub max_retries: u32,
}

fn default_notification_backend() -> String {
    "none".to_string()
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_notify_retries() -> u32 {
    3
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backend: default_notification_backend(),
            url: None,
            request_timeout_ms: default_request_timeout(),
            max_retries: default_notify_retries(),
        }
    }
}

impl NotificationConfig {
    pub fn http(&self) -> HttpNotifierConfig {
        HttpNotifierConfig {
            url: self.url.clone().unwrap_or_default(),
            request_timeout_ms: self.request_timeout_ms,
            max_retries: self.max_retries,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            Some(PathBuf::from("./chronoshelf.toml")),
            dirs::config_dir().map(|p| p.join("chronoshelf").join("config.toml")),
            Some(PathBuf::from("/etc/chronoshelf/config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Load overrides
        if let Some(plugin) = var("CHRONOSHELF_LOAD_PLUGIN") {
            self.load.plugin = plugin;
        }
        if let Some(bucket) = var("CHRONOSHELF_BUCKET") {
            self.load.bucket = Some(bucket);
        }
        if let Some(region) = var("CHRONOSHELF_AWS_REGION") {
            self.load.aws_region = region;
        }
        if let Some(root) = var("CHRONOSHELF_DATA_DIR") {
            self.load.local_root = PathBuf::from(root);
        }
        if let Some(strategy) = var("CHRONOSHELF_PARTITION_STRATEGY") {
            self.load.partition_strategy = strategy;
        }
        if let Some(compression) = var("CHRONOSHELF_COMPRESSION") {
            self.load.compression = compression;
        }

        // Lock and state overrides
        if let Some(backend) = var("CHRONOSHELF_LOCK_BACKEND") {
            self.lock.backend = backend;
        }
        if let Some(timeout) = var("CHRONOSHELF_LOCK_TIMEOUT") {
            if let Ok(t) = timeout.parse() {
                self.lock.timeout_seconds = t;
            }
        }
        if let Some(backend) = var("CHRONOSHELF_STATE_BACKEND") {
            self.state.backend = backend;
        }

        // Notification overrides; a URL alone switches delivery on
        if let Some(url) = var("CHRONOSHELF_NOTIFY_URL") {
            self.notification.url = Some(url);
            if self.notification.backend == "none" {
                self.notification.backend = "http".to_string();
            }
        }

        // Logging overrides
        if let Some(level) = var("CHRONOSHELF_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("CHRONOSHELF_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject names that no backend, strategy or codec answers to
    pub fn validate(&self) -> Result<(), ConfigError> {
        let plugins = [PLUGIN_S3, PLUGIN_LOCAL, PLUGIN_MEMORY];
        if !plugins.contains(&self.load.plugin.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "load.plugin = {:?}, expected one of {}",
                self.load.plugin,
                plugins.join(", ")
            )));
        }
        if self.load.plugin == PLUGIN_S3 && self.load.bucket.is_none() {
            return Err(ConfigError::Invalid(format!(
                "load.bucket is required by the {} plugin",
                PLUGIN_S3
            )));
        }
        PartitionStrategyFactory::create(Some(&self.load.partition_strategy))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        parse_compression(&self.load.compression).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        check_backend("lock.backend", &self.lock.backend, LOCK_BACKENDS)?;
        check_backend("state.backend", &self.state.backend, STATE_BACKENDS)?;
        check_backend("notification.backend", &self.notification.backend, NOTIFY_BACKENDS)?;
        if self.notification.backend == "http" && self.notification.url.is_none() {
            return Err(ConfigError::Invalid(
                "notification.url is required by the http backend".to_string(),
            ));
        }
        if self.lock.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "lock.timeout_seconds must be positive".to_string(),
            ));
        }
        if self.lock.timeout_seconds > MAX_LOCK_TIMEOUT.as_secs() {
            return Err(ConfigError::Invalid(format!(
                "lock.timeout_seconds = {} exceeds the maximum of {}",
                self.lock.timeout_seconds,
                MAX_LOCK_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }
}

fn check_backend(field: &str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} = {:?}, expected one of {}",
            field,
            value,
            allowed.join(", ")
        )))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chronoshelf Configuration
#
# Environment variables override these settings:
# - CHRONOSHELF_LOAD_PLUGIN
# - CHRONOSHELF_BUCKET
# - CHRONOSHELF_AWS_REGION
# - CHRONOSHELF_DATA_DIR
# - CHRONOSHELF_PARTITION_STRATEGY
# - CHRONOSHELF_COMPRESSION
# - CHRONOSHELF_LOCK_BACKEND
# - CHRONOSHELF_LOCK_TIMEOUT
# - CHRONOSHELF_STATE_BACKEND
# - CHRONOSHELF_NOTIFY_URL
# - CHRONOSHELF_LOG_LEVEL
# - CHRONOSHELF_LOG_FORMAT

[load]
# Storage plugin: s3_versioned, local_versioned or memory_versioned
plugin = "local_versioned"

# S3 bucket (s3_versioned only)
# bucket = "my-datasets"

# AWS region (s3_versioned only)
aws_region = "us-east-1"

# Root directory (local_versioned only)
local_root = "./chronoshelf_data/store"

# Partition layout: series_year_month or series_year
partition_strategy = "series_year_month"

# Parquet codec: snappy, zstd, lz4, gzip or uncompressed
compression = "snappy"

# Split partitions into part-NNNNN.parquet files above this many rows
# max_rows_per_file = 1000000

# Partition files uploaded concurrently
write_concurrency = 4

# Batches without data points: publish (new empty version) or skip
empty_batch = "publish"

[lock]
# Lock backend: memory, file or object_store
backend = "file"

# Fixed lock key (defaults to etl:{dataset_id})
# key = "etl:my-dataset"

# Lease lifetime in seconds
timeout_seconds = 300

# Lock file directory (file backend only)
dir = "./chronoshelf_data/locks"

[state]
# Watermark backend: none, file or object_store
backend = "file"

# State directory (file backend only)
dir = "./chronoshelf_data/state"

[retry]
# Object store retries for transient failures
max_attempts = 5
initial_backoff_ms = 100
max_backoff_ms = 5000
multiplier = 2.0

[notification]
# Projection update delivery: none, log or http
backend = "none"

# Endpoint for the http backend
# url = "http://localhost:8080/events"

request_timeout_ms = 5000
max_retries = 3

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/chronoshelf/chronoshelf.log"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.load.plugin, "local_versioned");
        assert_eq!(config.load.aws_region, "us-east-1");
        assert_eq!(config.load.partition_strategy, "series_year_month");
        assert_eq!(config.load.compression, "snappy");
        assert_eq!(config.load.empty_batch, EmptyBatchPolicy::Publish);
        assert_eq!(config.lock.lock_key("d1"), "etl:d1");
        assert_eq!(config.lock.timeout(), Duration::from_secs(300));
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.notification.backend, "none");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.load.write_concurrency, 4);
        assert_eq!(config.lock.backend, "file");
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chronoshelf.toml");
        std::fs::write(
            &path,
            r#"
[load]
plugin = "s3_versioned"
bucket = "datasets"
empty_batch = "skip"
max_rows_per_file = 500

[lock]
backend = "object_store"
key = "etl:shared"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.load.bucket.as_deref(), Some("datasets"));
        assert_eq!(config.load.empty_batch, EmptyBatchPolicy::Skip);
        assert_eq!(config.load.max_rows_per_file, Some(500));
        assert_eq!(config.load.compression, "snappy");
        assert_eq!(config.lock.lock_key("d1"), "etl:shared");
        assert_eq!(config.state.backend, "file");
        assert_eq!(config.load.bucket_label(), "datasets");

        let loader = config.load.loader_config(config.retry.policy());
        assert_eq!(loader.max_rows_per_file, Some(500));
        assert_eq!(loader.empty_batch, EmptyBatchPolicy::Skip);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[load\nplugin = 1").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHRONOSHELF_LOAD_PLUGIN", "memory_versioned"),
            ("CHRONOSHELF_COMPRESSION", "zstd"),
            ("CHRONOSHELF_LOCK_TIMEOUT", "60"),
            ("CHRONOSHELF_NOTIFY_URL", "http://hooks.local/events"),
            ("CHRONOSHELF_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.load.plugin, "memory_versioned");
        assert_eq!(config.load.compression, "zstd");
        assert_eq!(config.lock.timeout_seconds, 60);
        assert_eq!(config.notification.backend, "http");
        assert_eq!(
            config.notification.http().url,
            "http://hooks.local/events"
        );
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_names() {
        let mut config = Config::default();
        config.load.partition_strategy = "by_week".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.load.plugin = "s3_versioned".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lock.backend = "zookeeper".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock.backend"));

        let mut config = Config::default();
        config.notification.backend = "http".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_lock_timeout() {
        let mut config = Config::default();
        config.lock.timeout_seconds = 0;
        assert!(config.validate().is_err());

        config.lock.timeout_seconds = MAX_LOCK_TIMEOUT.as_secs();
        assert!(config.validate().is_ok());

        config.lock.timeout_seconds = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock.timeout_seconds"));
    }
}
