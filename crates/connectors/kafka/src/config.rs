use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::decoder::DecodeErrorPolicy;
use crate::retry::RetryPolicy;

/// Connector settings.
///
/// Loaded from an optional TOML file (`IGLOO_KAFKA_CONFIG_PATH`, default
/// `etc/kafka/connector.toml`) overlaid with `IGLOO_KAFKA__*` environment
/// variables, e.g. `IGLOO_KAFKA__MESSAGES_PER_SPLIT=5000` or
/// `IGLOO_KAFKA__RETRY__MAX_ATTEMPTS=3`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Broker addresses, `host:port`.
    pub nodes: Vec<String>,
    pub default_schema: String,
    /// Tables served with internal columns only, no description needed.
    pub table_names: Vec<String>,
    pub table_description_dir: PathBuf,
    pub hide_internal_columns: bool,
    /// Target records per split; `0` keeps one split per partition.
    pub messages_per_split: u64,
    pub fetch_max_records: usize,
    pub batch_size: usize,
    pub poll_timeout_ms: u64,
    pub on_decode_error: DecodeErrorPolicy,
    /// Splits read at once by the engine.
    pub max_concurrent_splits: usize,
    pub retry: RetrySettings,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            default_schema: "default".to_string(),
            table_names: Vec::new(),
            table_description_dir: PathBuf::from("etc/kafka"),
            hide_internal_columns: true,
            messages_per_split: 100_000,
            fetch_max_records: 500,
            batch_size: 1024,
            poll_timeout_ms: 1000,
            on_decode_error: DecodeErrorPolicy::Fail,
            max_concurrent_splits: 8,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 5, initial_backoff_ms: 50, max_backoff_ms: 2000 }
    }
}

impl KafkaConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("IGLOO_KAFKA_CONFIG_PATH")
            .unwrap_or_else(|_| "etc/kafka/connector.toml".to_string());
        Self::load(Some(Path::new(&config_file_path)), false)
    }

    /// Loads `path` (which must exist) with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        Self::load(Some(path.as_ref()), true)
    }

    fn load(path: Option<&Path>, required: bool) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(required));
        }
        let s = builder
            .add_source(
                config::Environment::with_prefix("IGLOO_KAFKA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("nodes")
                    .with_list_parse_key("table_names"),
            )
            .build()?;
        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.fetch_max_records == 0 {
            return Err(config::ConfigError::Message("fetch_max_records must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(config::ConfigError::Message("batch_size must be positive".into()));
        }
        if self.max_concurrent_splits == 0 {
            return Err(config::ConfigError::Message("max_concurrent_splits must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(config::ConfigError::Message("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }
}
