//! Configuration structures for the ingestion source.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Kafka configuration
    pub kafka: KafkaConfig,

    /// Batching bounds
    #[serde(default)]
    pub batch: BatchConfig,

    /// Geo enrichment configuration
    #[serde(default)]
    pub geo: GeoConfig,

    /// Delivery sink configuration
    #[serde(default)]
    pub sink: SinkConfig,

    /// Poll runner backoff configuration
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from (exactly one)
    #[serde(default)]
    pub topic: String,

    /// Consumer group ID
    #[serde(default)]
    pub consumer_group: String,

    /// Let librdkafka commit delivered offsets periodically instead of
    /// committing once per delivered batch
    #[serde(default)]
    pub auto_commit: bool,

    /// Per-fetch wait for the next record in milliseconds
    #[serde(default = "default_consumer_timeout_ms")]
    pub consumer_timeout_ms: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Time allowed for the initial metadata fetch at start
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Auto offset reset strategy
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,

    /// Extra librdkafka properties, passed through verbatim
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl KafkaConfig {
    /// Per-fetch timeout.
    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_timeout_ms)
    }

    /// Timeout for establishing the connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Kafka auto offset reset strategy.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

impl OffsetReset {
    /// librdkafka property value.
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// Batch accumulation bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Maximum number of records handed to the sink at once
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum wall-clock duration of one poll cycle in milliseconds
    #[serde(default = "default_max_batch_duration_ms")]
    pub max_batch_duration_ms: u64,
}

impl BatchConfig {
    /// Time bound of one cycle.
    pub fn max_batch_duration(&self) -> Duration {
        Duration::from_millis(self.max_batch_duration_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_duration_ms: default_max_batch_duration_ms(),
        }
    }
}

/// Geo enrichment configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeoConfig {
    /// MaxMind City database (`.mmdb`). Without it every lookup
    /// resolves to the unknown location.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Language of the location names, e.g. "en" or "zh-CN"
    #[serde(default = "default_geo_locale")]
    pub locale: String,

    /// Per-lookup timeout in milliseconds
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl GeoConfig {
    /// Per-lookup timeout.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            locale: default_geo_locale(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

/// File sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Output file, appended to
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,

    /// Line format
    #[serde(default)]
    pub format: SinkFormat,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
            format: SinkFormat::default(),
        }
    }
}

/// Line format written by the file sink.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// Record body only
    #[default]
    Body,
    /// JSON object with headers and body
    Json,
}

/// Backoff policy applied by the poll runner between BACKOFF cycles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Added to the sleep for every consecutive BACKOFF
    #[serde(default = "default_backoff_increment_ms")]
    pub backoff_increment_ms: u64,

    /// Upper bound of the sleep
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backoff_increment_ms: default_backoff_increment_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive usable with an env filter.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions

fn default_consumer_timeout_ms() -> u64 {
    10
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_connect_timeout_ms() -> u64 {
    10000
}
fn default_max_batch_size() -> usize {
    1000
}
fn default_max_batch_duration_ms() -> u64 {
    1000
}
fn default_lookup_timeout_ms() -> u64 {
    50
}
fn default_geo_locale() -> String {
    "en".to_string()
}
fn default_sink_path() -> PathBuf {
    PathBuf::from("./ums-events.log")
}
fn default_backoff_increment_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.kafka.topic.trim().is_empty() {
            return Err(crate::Error::Config("Kafka topic must be specified".into()));
        }

        if self.kafka.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if self.kafka.consumer_group.is_empty() {
            return Err(crate::Error::Config("Consumer group is required".into()));
        }

        if self.batch.max_batch_size == 0 {
            return Err(crate::Error::Config(
                "max_batch_size must be greater than zero".into(),
            ));
        }

        if self.batch.max_batch_duration_ms == 0 {
            return Err(crate::Error::Config(
                "max_batch_duration_ms must be greater than zero".into(),
            ));
        }

        if self.kafka.consumer_timeout_ms >= self.batch.max_batch_duration_ms {
            tracing::warn!(
                consumer_timeout_ms = self.kafka.consumer_timeout_ms,
                max_batch_duration_ms = self.batch.max_batch_duration_ms,
                "Per-fetch timeout is not below the cycle time bound; cycles will overrun"
            );
        }

        Ok(())
    }
}
