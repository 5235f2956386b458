use crate::storage_key::ReferenceTimeZone;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the archiver service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// MQTT broker configuration
    pub mqtt: MqttConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Archive layout configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Upload retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

/// How long the pipeline keeps listening
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Listen until a shutdown signal arrives
    #[default]
    Continuous,
    /// Stop after the first successfully archived message
    SingleShot,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Port for the /health and /ready endpoints
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Seconds to wait for in-flight uploads on shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// MQTT broker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, e.g. mqtts://broker.example.com:8883
    pub broker_url: String,
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Use TLS for the broker connection. Implied by an mqtts:// URL.
    #[serde(default)]
    pub use_tls: bool,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Capacity of the client request channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Delay before polling again after a broker error
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for archived messages
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Upload concurrency limit
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

/// Archive layout configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Deployment environment, first segment of every key
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Source version segment of every key
    #[serde(default = "default_source_version")]
    pub source_version: String,
    /// Facility identifier the default topic set is rooted at
    #[serde(default = "default_facility_id")]
    pub facility_id: String,
    /// Explicit topic filters. Empty means the default facility set.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Reference time zone for date partitioning (utc, local, +HH:MM)
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    /// Push a synthetic message through the pipeline after subscribing
    #[serde(default)]
    pub self_test_on_startup: bool,
}

/// Upload retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total upload attempts per message, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Event streams archived for a facility
pub const FACILITY_EVENT_STREAMS: [&str; 4] =
    ["entries", "exits", "paymenttransactions", "door-transitions"];

// Default value functions
fn default_service_name() -> String {
    "telemetry-archiver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_health_port() -> u16 {
    8080
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_client_id() -> String {
    "telemetry-archiver".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    100
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_source_version() -> String {
    "sv1".to_string()
}

fn default_facility_id() -> String {
    "815768fd-aa5c-4ca2-8315-88c98662046a".to_string()
}

fn default_time_zone() -> String {
    "utc".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    200
}

fn default_max_interval_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "telemetry-archiver")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/archiver").required(false))
            .add_source(config::File::with_name("/etc/telemetry/archiver").required(false))
            // Override with environment variables
            // ARCHIVER__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("ARCHIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("mqtt.broker_url".to_string()));
        }
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }
        if self.s3.upload_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "s3.upload_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.topic_patterns().is_empty() {
            return Err(ConfigError::MissingRequired(
                "archive.topics or archive.facility_id".to_string(),
            ));
        }
        self.reference_time_zone()?;
        Ok(())
    }

    /// The subscription set: explicit topics, or the four facility event streams
    pub fn topic_patterns(&self) -> Vec<String> {
        if !self.archive.topics.is_empty() {
            return self.archive.topics.clone();
        }
        if self.archive.facility_id.trim().is_empty() {
            return Vec::new();
        }
        facility_topics(&self.archive.facility_id)
    }

    /// Key prefix shared by every archived object
    pub fn key_prefix(&self) -> String {
        format!(
            "{}/ingest/{}/mqtt",
            self.archive.environment, self.archive.source_version
        )
    }

    pub fn reference_time_zone(&self) -> Result<ReferenceTimeZone, ConfigError> {
        self.archive
            .time_zone
            .parse()
            .map_err(|e: String| ConfigError::InvalidValue {
                key: "archive.time_zone".to_string(),
                message: e,
            })
    }

    /// Get drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.service.drain_timeout_secs)
    }

    /// Get broker reconnect delay as Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt.reconnect_delay_ms)
    }
}

/// Wildcard filters for every archived event stream of a facility
pub fn facility_topics(facility_id: &str) -> Vec<String> {
    FACILITY_EVENT_STREAMS
        .iter()
        .map(|stream| format!("/carparks/{}/events/{}/#", facility_id, stream))
        .collect()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            run_mode: RunMode::default(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            source_version: default_source_version(),
            facility_id: default_facility_id(),
            topics: Vec::new(),
            time_zone: default_time_zone(),
            self_test_on_startup: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            mqtt: MqttConfig {
                broker_url: "mqtts://broker.local:8883".to_string(),
                client_id: default_client_id(),
                username: None,
                password: None,
                use_tls: false,
                keep_alive_secs: default_keep_alive_secs(),
                clean_session: true,
                channel_capacity: default_channel_capacity(),
                reconnect_delay_ms: default_reconnect_delay_ms(),
            },
            s3: S3Config {
                bucket: "telemetry-archive".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                upload_concurrency: default_upload_concurrency(),
            },
            archive: ArchiveConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_attempts(), 3);
        assert_eq!(default_drain_timeout_secs(), 10);
        assert_eq!(default_environment(), "dev");
        assert_eq!(default_source_version(), "sv1");
    }

    #[test]
    fn test_default_topic_set_covers_facility_streams() {
        let config = test_config();
        let topics = config.topic_patterns();

        assert_eq!(topics.len(), 4);
        assert_eq!(
            topics[0],
            "/carparks/815768fd-aa5c-4ca2-8315-88c98662046a/events/entries/#"
        );
        assert!(topics[3].ends_with("/events/door-transitions/#"));
    }

    #[test]
    fn test_explicit_topics_override_facility() {
        let mut config = test_config();
        config.archive.topics = vec!["site/+/events/#".to_string()];

        assert_eq!(config.topic_patterns(), vec!["site/+/events/#".to_string()]);
    }

    #[test]
    fn test_key_prefix() {
        let mut config = test_config();
        assert_eq!(config.key_prefix(), "dev/ingest/sv1/mqtt");

        config.archive.environment = "prod".to_string();
        assert_eq!(config.key_prefix(), "prod/ingest/sv1/mqtt");
    }

    #[test]
    fn test_validate_rejects_empty_bucket() {
        let mut config = test_config();
        config.s3.bucket = " ".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "s3.bucket"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = test_config();
        config.retry.max_attempts = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_topic_set() {
        let mut config = test_config();
        config.archive.facility_id = String::new();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_time_zone() {
        let mut config = test_config();
        config.archive.time_zone = "mars/olympus".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "archive.time_zone"
        ));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }
}
