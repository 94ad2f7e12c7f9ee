//! Server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Reading queue settings.
    pub queue: QueueConfig,
    /// Aggregation consumer settings.
    pub aggregation: AggregationConfig,
    /// API security settings.
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every error found.
    ///
    /// ```
    /// use tempstat_service::Config;
    ///
    /// let config = Config::default();
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.queue.validate());
        errors.extend(self.aggregation.validate());
        errors.extend(self.security.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
            return errors;
        }

        match self.bind.rsplit_once(':') {
            None => errors.push(ValidationError::new(
                "server.bind",
                format!(
                    "invalid bind address '{}': expected format 'host:port'",
                    self.bind
                ),
            )),
            Some((_, port)) => match port.parse::<u16>() {
                Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                Ok(_) => {}
                Err(_) => errors.push(ValidationError::new(
                    "server.bind",
                    format!("invalid port '{}': must be a number 1-65535", port),
                )),
            },
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: tempstat_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        errors
    }
}

/// Which transport carries readings from ingestion to aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process bounded channel.
    #[default]
    Memory,
    /// MQTT broker (requires the `mqtt` feature).
    Mqtt,
}

/// Reading queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Buffered messages for the memory backend, and the MQTT request channel size.
    pub capacity: usize,
    /// How long ingestion waits for room in a full queue before failing.
    pub publish_timeout_ms: u64,
    /// Broker URL (`mqtt://host:port` or `mqtts://host:port`).
    pub broker: String,
    pub topic: String,
    /// Client identifier prefix. Publisher and consumer append `-publisher`/`-consumer`.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            capacity: 1024,
            publish_timeout_ms: 1000,
            broker: "mqtt://localhost:1883".to_string(),
            topic: "temperature-readings".to_string(),
            client_id: "tempstat".to_string(),
            keep_alive: 30,
            username: None,
            password: None,
        }
    }
}

impl QueueConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.capacity == 0 {
            errors.push(ValidationError::new(
                "queue.capacity",
                "capacity must be at least 1",
            ));
        }
        if self.publish_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "queue.publish_timeout_ms",
                "publish timeout must be greater than 0",
            ));
        }

        if self.backend == QueueBackend::Mqtt {
            if !self.broker.starts_with("mqtt://") && !self.broker.starts_with("mqtts://") {
                errors.push(ValidationError::new(
                    "queue.broker",
                    format!(
                        "invalid broker URL '{}': must start with mqtt:// or mqtts://",
                        self.broker
                    ),
                ));
            }
            if self.topic.is_empty() || self.topic.contains(['#', '+']) {
                errors.push(ValidationError::new(
                    "queue.topic",
                    "topic must be non-empty and contain no wildcards",
                ));
            }
            if self.client_id.is_empty() {
                errors.push(ValidationError::new(
                    "queue.client_id",
                    "client id cannot be empty",
                ));
            }
            if self.keep_alive < 5 {
                errors.push(ValidationError::new(
                    "queue.keep_alive",
                    format!(
                        "keep alive {} is too short (minimum 5 seconds)",
                        self.keep_alive
                    ),
                ));
            }
        }

        errors
    }
}

/// Aggregation consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Retries for transient database lock errors before a reading is dropped.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long shutdown waits for the consumer to drain queued readings.
    pub drain_timeout_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            drain_timeout_secs: 30,
        }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.initial_backoff_ms == 0 {
            errors.push(ValidationError::new(
                "aggregation.initial_backoff_ms",
                "initial backoff must be greater than 0",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            errors.push(ValidationError::new(
                "aggregation.max_backoff_ms",
                format!(
                    "max backoff {}ms is below the initial backoff {}ms",
                    self.max_backoff_ms, self.initial_backoff_ms
                ),
            ));
        }

        errors
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Retry policy for recording readings.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
    }
}

/// Minimum API key length.
pub const MIN_API_KEY_LENGTH: usize = 16;

/// API security configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require an `X-API-Key` header on every route except `/api/health`.
    pub api_key_enabled: bool,
    pub api_key: Option<String>,
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.api_key_enabled {
            match &self.api_key {
                None => errors.push(ValidationError::new(
                    "security.api_key",
                    "api key must be set when api_key_enabled is true",
                )),
                Some(key) if key.len() < MIN_API_KEY_LENGTH => {
                    errors.push(ValidationError::new(
                        "security.api_key",
                        format!(
                            "api key is too short (minimum {} characters)",
                            MIN_API_KEY_LENGTH
                        ),
                    ))
                }
                Some(_) => {}
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `queue.broker`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tempstat")
        .join("server.toml")
}
