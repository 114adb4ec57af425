//! Configuration structures for t2t.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Broker connection configuration
    pub broker: BrokerConfig,

    /// Topic routing and processing configuration
    pub stream: StreamConfig,

    /// Retry and backoff configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Offset checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Broker connection configuration.
///
/// Values are handed to the broker client as-is.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Bootstrap servers (host:port)
    pub bootstrap_servers: Vec<String>,

    /// Socket connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u32,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Broker security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
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

    /// SSL client certificate location
    pub ssl_cert_location: Option<PathBuf>,

    /// SSL client key location
    pub ssl_key_location: Option<PathBuf>,
}

/// Topic routing and per-batch processing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Topic to consume from
    pub input_topic: String,

    /// Topic to publish to
    pub output_topic: String,

    /// Group ID, also the checkpoint namespace
    pub group_id: String,

    /// Explicit partition assignment (all topic partitions when absent)
    #[serde(default)]
    pub partitions: Option<Vec<i32>>,

    /// Maximum records per pulled batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long a pull waits for data before returning an empty batch
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// How long a single publish attempt waits for acknowledgment
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Where to start when a partition has no checkpoint
    #[serde(default)]
    pub start_from: OffsetReset,

    /// Built-in transform applied to every record
    #[serde(default)]
    pub transform: TransformKind,

    /// What to do with records the transform rejects
    #[serde(default)]
    pub on_transform_error: TransformErrorPolicy,

    /// What a fatal partition error does to the rest of the engine
    #[serde(default)]
    pub on_partition_failure: FailurePolicy,

    /// How output records are spread over output partitions
    #[serde(default)]
    pub output_partitioning: OutputPartitioning,
}

/// Start position for partitions without a checkpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

/// Built-in transforms selectable from configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// Pass records through unchanged
    Identity,
    /// Uppercase UTF-8 values
    #[default]
    Uppercase,
    /// Lowercase UTF-8 values
    Lowercase,
}

/// Policy for records the transform cannot process.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformErrorPolicy {
    /// Log, count and move on
    #[default]
    Skip,
    /// Stop the partition worker at the bad record
    Fail,
}

/// Policy for fatal partition worker errors.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop only the failing partition
    #[default]
    Isolate,
    /// Drain and stop the whole engine
    FailFast,
}

/// Output partition selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputPartitioning {
    /// Publish to the same partition number the record was read from
    #[default]
    Preserve,
    /// Let the broker hash the record key
    ByKey,
}

/// Retry and backoff configuration for transient failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Base backoff delay in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Retries allowed after the first failure before the error turns fatal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Add ±25% jitter to delays
    #[serde(default = "default_enabled")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
            jitter: default_enabled(),
        }
    }
}

/// Checkpoint store backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Append-only log on local disk
    #[default]
    File,
    /// Broker consumer-group offsets
    Broker,
}

/// Offset checkpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Which store to use
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Directory for checkpoint segments (file backend)
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Commits between compaction snapshots
    #[serde(default = "default_compaction_interval_entries")]
    pub compaction_interval_entries: usize,

    /// Maximum number of segment files to keep
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
            compaction_interval_entries: default_compaction_interval_entries(),
            max_segments: default_max_segments(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

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
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string for an env filter.
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
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_connect_timeout_ms() -> u32 {
    10000
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_max_batch_size() -> usize {
    500
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_publish_timeout_ms() -> u64 {
    5000
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    30000
}
fn default_max_retries() -> u32 {
    10
}
fn default_enabled() -> bool {
    true
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}
fn default_compaction_interval_entries() -> usize {
    1000
}
fn default_max_segments() -> usize {
    4
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl StreamConfig {
    /// Minimal stream configuration with defaults for everything optional.
    pub fn new(
        input_topic: impl Into<String>,
        output_topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            input_topic: input_topic.into(),
            output_topic: output_topic.into(),
            group_id: group_id.into(),
            partitions: None,
            max_batch_size: default_max_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            start_from: OffsetReset::default(),
            transform: TransformKind::default(),
            on_transform_error: TransformErrorPolicy::default(),
            on_partition_failure: FailurePolicy::default(),
            output_partitioning: OutputPartitioning::default(),
        }
    }
}

impl BrokerConfig {
    /// Broker configuration with default timeouts and no security.
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers,
            connect_timeout_ms: default_connect_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            security: SecurityConfig::default(),
        }
    }
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
        if self.broker.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if self.stream.input_topic.is_empty() {
            return Err(crate::Error::Config("Input topic is required".into()));
        }

        if self.stream.output_topic.is_empty() {
            return Err(crate::Error::Config("Output topic is required".into()));
        }

        if self.stream.input_topic == self.stream.output_topic {
            return Err(crate::Error::Config(
                "Input and output topic must differ".into(),
            ));
        }

        if self.stream.group_id.is_empty() {
            return Err(crate::Error::Config("Group id is required".into()));
        }

        if matches!(self.stream.group_id.as_str(), "." | "..")
            || self.stream.group_id.contains(&['/', '\\'][..])
        {
            return Err(crate::Error::Config(format!(
                "Group id '{}' must not contain path separators or be '.' or '..'",
                self.stream.group_id
            )));
        }

        if self.stream.max_batch_size == 0 {
            return Err(crate::Error::Config(
                "max_batch_size must be greater than zero".into(),
            ));
        }

        if self.stream.poll_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "poll_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.stream.publish_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "publish_timeout_ms must be greater than zero".into(),
            ));
        }

        if let Some(partitions) = &self.stream.partitions {
            if partitions.is_empty() {
                return Err(crate::Error::Config(
                    "Explicit partition list must not be empty".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            if let Some(dup) = partitions.iter().find(|p| !seen.insert(**p)) {
                return Err(crate::Error::Config(format!(
                    "Partition {} assigned twice",
                    dup
                )));
            }
        }

        if self.retry.max_backoff_ms < self.retry.retry_backoff_ms {
            return Err(crate::Error::Config(
                "max_backoff_ms must be >= retry_backoff_ms".into(),
            ));
        }

        if self.checkpoint.compaction_interval_entries == 0 {
            return Err(crate::Error::Config(
                "compaction_interval_entries must be greater than zero".into(),
            ));
        }

        if self.checkpoint.max_segments == 0 {
            return Err(crate::Error::Config(
                "max_segments must be at least 1".into(),
            ));
        }

        if self.stream.poll_timeout_ms > self.broker.session_timeout_ms as u64 {
            tracing::warn!(
                poll_timeout_ms = self.stream.poll_timeout_ms,
                session_timeout_ms = self.broker.session_timeout_ms,
                "Poll timeout exceeds session timeout; shutdown may be slow to observe"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            broker: BrokerConfig::new(vec!["localhost:9092".into()]),
            stream: StreamConfig::new("in", "out", "group"),
            retry: RetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_servers() {
        let mut config = test_config();
        config.broker.bootstrap_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_topic() {
        let mut config = test_config();
        config.stream.input_topic = "".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Input topic"));
    }

    #[test]
    fn test_config_validation_same_topics() {
        let mut config = test_config();
        config.stream.output_topic = "in".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_config_validation_empty_group() {
        let mut config = test_config();
        config.stream.group_id = "".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Group id"));
    }

    #[test]
    fn test_config_validation_zero_batch() {
        let mut config = test_config();
        config.stream.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_timeouts() {
        let mut config = test_config();
        config.stream.poll_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll_timeout_ms"));

        let mut config = test_config();
        config.stream.publish_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("publish_timeout_ms"));
    }

    #[test]
    fn test_config_validation_group_id_path() {
        for group in ["a/b", "..", ".", "a\\b", "../escape"] {
            let mut config = test_config();
            config.stream.group_id = group.into();
            assert!(config.validate().is_err(), "accepted group id {:?}", group);
        }

        let mut config = test_config();
        config.stream.group_id = "orders.v2-etl".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_duplicate_partition() {
        let mut config = test_config();
        config.stream.partitions = Some(vec![0, 1, 0]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Partition 0"));
    }

    #[test]
    fn test_config_validation_backoff_cap() {
        let mut config = test_config();
        config.retry.retry_backoff_ms = 500;
        config.retry.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.retry_backoff_ms, 100);
        assert_eq!(config.max_backoff_ms, 30000);
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_default_checkpoint_config() {
        let config = CheckpointConfig::default();
        assert_eq!(config.backend, CheckpointBackend::File);
        assert_eq!(config.dir, PathBuf::from("./checkpoints"));
        assert_eq!(config.compaction_interval_entries, 1000);
        assert_eq!(config.max_segments, 4);
    }

    #[test]
    fn test_default_monitoring_config() {
        let config = MonitoringConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [broker]
            bootstrap_servers = ["broker-1:9092", "broker-2:9092"]

            [broker.security]
            protocol = "SASL_SSL"
            sasl_mechanism = "SCRAM-SHA-256"

            [stream]
            input_topic = "events"
            output_topic = "events-upper"
            group_id = "upper"
            max_batch_size = 100
            partitions = [0, 2]
            on_transform_error = "fail"
            on_partition_failure = "fail_fast"
            output_partitioning = "by_key"

            [retry]
            retry_backoff_ms = 50
            max_retries = 3

            [checkpoint]
            backend = "broker"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.bootstrap_servers.len(), 2);
        assert_eq!(config.broker.security.protocol.as_deref(), Some("SASL_SSL"));
        assert_eq!(config.stream.max_batch_size, 100);
        assert_eq!(config.stream.partitions, Some(vec![0, 2]));
        assert_eq!(config.stream.transform, TransformKind::Uppercase);
        assert_eq!(config.stream.on_transform_error, TransformErrorPolicy::Fail);
        assert_eq!(config.stream.on_partition_failure, FailurePolicy::FailFast);
        assert_eq!(config.stream.output_partitioning, OutputPartitioning::ByKey);
        assert_eq!(config.retry.retry_backoff_ms, 50);
        assert_eq!(config.retry.max_backoff_ms, 30000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Broker);
    }

    #[test]
    fn test_offset_reset_variants() {
        assert_eq!(OffsetReset::default(), OffsetReset::Earliest);
        assert_ne!(OffsetReset::Earliest, OffsetReset::Latest);
    }

    #[test]
    fn test_policy_defaults() {
        assert_eq!(TransformErrorPolicy::default(), TransformErrorPolicy::Skip);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Isolate);
        assert_eq!(OutputPartitioning::default(), OutputPartitioning::Preserve);
    }
}
