//! Configuration for the discovery pipeline.
//!
//! Values come from built-in defaults, then an optional config file, then the
//! process environment. Environment variables use their plain names
//! (`KAFKA_TOPIC`, `BATCH_SIZE`, ...), which map one-to-one onto the fields
//! below.

use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the pipeline service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Topic carrying framed image records
    #[serde(default = "default_topic")]
    pub kafka_topic: String,
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_server")]
    pub kafka_bootstrap_server: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub kafka_consumer_group: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub kafka_client_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub kafka_auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub kafka_session_timeout_ms: u64,
    /// SASL username
    pub kafka_sasl_username: Option<String>,
    /// SASL password
    pub kafka_sasl_password: Option<String>,

    /// Items per inference batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Capacity of the fetch -> inference queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Predictions strictly above this are persisted
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Eviction ceiling for discovery files on disk
    #[serde(default = "default_max_stored_files")]
    pub max_stored_files: usize,
    /// Directory receiving discovery images
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// ONNX model file
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// JSON label table mapping class index to label
    #[serde(default = "default_classes_path")]
    pub classes_path: PathBuf,
    /// Square edge length the model expects
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Document store connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Document store connect timeout in seconds
    #[serde(default = "default_database_connect_timeout_secs")]
    pub database_connect_timeout_secs: u64,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Number of discovery save workers
    #[serde(default = "default_save_workers")]
    pub save_workers: usize,
    /// Pending saves allowed before hits are dropped
    #[serde(default = "default_save_queue_size")]
    pub save_queue_size: usize,
    /// Bus poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Work queue get timeout in milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Interval between checks for model artifacts
    #[serde(default = "default_artifact_poll_secs")]
    pub artifact_poll_secs: u64,
    /// Time allowed for a cooperative shutdown before tasks are aborted
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

// Default value functions
fn default_topic() -> String {
    "image_data".to_string()
}

fn default_bootstrap_server() -> String {
    "localhost:9092".to_string()
}

fn default_consumer_group() -> String {
    "gpu_cluster_h100".to_string()
}

fn default_client_id() -> String {
    "discovery-pipeline".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_batch_size() -> usize {
    8
}

fn default_queue_size() -> usize {
    200
}

fn default_confidence_threshold() -> f32 {
    0.90
}

fn default_max_stored_files() -> usize {
    100
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./discoveries")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("model.onnx")
}

fn default_classes_path() -> PathBuf {
    PathBuf::from("classes.json")
}

fn default_input_size() -> u32 {
    224
}

fn default_database_url() -> String {
    "postgres://localhost:5432/lab_discovery_db".to_string()
}

fn default_database_connect_timeout_secs() -> u64 {
    5
}

fn default_metrics_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_save_workers() -> usize {
    4
}

fn default_save_queue_size() -> usize {
    256
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_queue_timeout_ms() -> u64 {
    1000
}

fn default_artifact_poll_secs() -> u64 {
    2
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka_topic: default_topic(),
            kafka_bootstrap_server: default_bootstrap_server(),
            kafka_consumer_group: default_consumer_group(),
            kafka_client_id: default_client_id(),
            kafka_auto_offset_reset: default_auto_offset_reset(),
            kafka_session_timeout_ms: default_session_timeout_ms(),
            kafka_sasl_username: None,
            kafka_sasl_password: None,
            batch_size: default_batch_size(),
            queue_size: default_queue_size(),
            confidence_threshold: default_confidence_threshold(),
            max_stored_files: default_max_stored_files(),
            storage_path: default_storage_path(),
            model_path: default_model_path(),
            classes_path: default_classes_path(),
            input_size: default_input_size(),
            database_url: default_database_url(),
            database_connect_timeout_secs: default_database_connect_timeout_secs(),
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
            save_workers: default_save_workers(),
            save_queue_size: default_save_queue_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            queue_timeout_ms: default_queue_timeout_ms(),
            artifact_poll_secs: default_artifact_poll_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/discovery").required(false))
            .add_source(config::File::with_name("/etc/discovery/pipeline").required(false))
            // BATCH_SIZE -> batch_size, KAFKA_TOPIC -> kafka_topic
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka_bootstrap_server.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka_bootstrap_server".to_string(),
            ));
        }

        if self.kafka_topic.is_empty() {
            return Err(ConfigError::MissingRequired("kafka_topic".to_string()));
        }

        if self.kafka_consumer_group.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka_consumer_group".to_string(),
            ));
        }

        let positive = [
            ("batch_size", self.batch_size),
            ("queue_size", self.queue_size),
            ("max_stored_files", self.max_stored_files),
            ("save_workers", self.save_workers),
            ("save_queue_size", self.save_queue_size),
            ("input_size", self.input_size as usize),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "confidence_threshold".to_string(),
                message: format!("{} is outside [0, 1]", self.confidence_threshold),
            });
        }

        Ok(())
    }

    /// Build the rdkafka consumer configuration
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.kafka_bootstrap_server)
            .set("client.id", &self.kafka_client_id)
            .set("group.id", &self.kafka_consumer_group)
            .set("auto.offset.reset", &self.kafka_auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set(
                "session.timeout.ms",
                self.kafka_session_timeout_ms.to_string(),
            );

        if let (Some(ref username), Some(ref password)) =
            (&self.kafka_sasl_username, &self.kafka_sasl_password)
        {
            config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        config
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn artifact_poll_interval(&self) -> Duration {
        Duration::from_secs(self.artifact_poll_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn database_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database_connect_timeout_secs)
    }
}
