//! Configuration management for BlogForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! Every section has defaults, so an empty environment boots with the
//! in-memory store and queue.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Generation queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Article generation pipeline configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Article lifecycle rules
    #[serde(default)]
    pub articles: ArticlesConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Where articles and generation jobs are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Storage backend
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// Primary database URL (for writes)
    #[serde(default)]
    pub url: Option<String>,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply pending migrations on startup
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

/// Transport used for generation job messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Memory,
    Sqs,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Queue backend
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,

    /// SQS generation queue URL
    pub generation_queue_url: Option<String>,

    /// AWS region override (falls back to the default provider chain)
    pub region: Option<String>,

    /// Maximum messages to receive per poll
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: u32,

    /// Long polling timeout in seconds
    #[serde(default = "default_queue_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Visibility timeout in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Interpreter used to run the stage scripts
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Directory containing the stage scripts
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Timeout for a single stage invocation in seconds
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Total attempts per job, first run included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound for one attempt of the whole pipeline in seconds
    #[serde(default = "default_max_run_time")]
    pub max_run_time_secs: u64,

    /// Number of jobs processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay before the first retry; doubles on each further attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    /// Run the worker pool inside the gateway process
    #[serde(default = "default_enabled")]
    pub embedded_worker: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArticlesConfig {
    /// Allow publishing an article whose content is still empty
    #[serde(default)]
    pub allow_empty_publish: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// JWT secret for token validation
    pub jwt_secret: Option<String>,

    /// JWT expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full env-filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// OpenTelemetry endpoint
    pub otel_endpoint: Option<String>,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_storage_backend() -> StorageBackend { StorageBackend::Memory }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_queue_backend() -> QueueBackend { QueueBackend::Memory }
fn default_queue_batch_size() -> u32 { 4 }
fn default_queue_poll_timeout() -> u64 { 20 }
fn default_visibility_timeout() -> u64 { 360 }
fn default_interpreter() -> String { "python3".to_string() }
fn default_scripts_dir() -> PathBuf { PathBuf::from("scripts") }
fn default_stage_timeout() -> u64 { 120 }
fn default_max_attempts() -> u32 { 3 }
fn default_max_run_time() -> u64 { 300 }
fn default_workers() -> usize { 4 }
fn default_retry_base_delay() -> u64 { 5 }
fn default_jwt_expiration() -> u64 { 3600 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "blogforge".to_string() }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            url: None,
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            run_migrations: default_enabled(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            generation_queue_url: None,
            region: None,
            batch_size: default_queue_batch_size(),
            poll_timeout_secs: default_queue_poll_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            scripts_dir: default_scripts_dir(),
            stage_timeout_secs: default_stage_timeout(),
            max_attempts: default_max_attempts(),
            max_run_time_secs: default_max_run_time(),
            workers: default_workers(),
            retry_base_delay_secs: default_retry_base_delay(),
            embedded_worker: default_enabled(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expiration_secs: default_jwt_expiration(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            otel_endpoint: None,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl GenerationConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn max_run_time(&self) -> Duration {
        Duration::from_secs(self.max_run_time_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.max_attempts == 0 {
            return Err(ConfigError::Message(
                "generation.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.generation.workers == 0 {
            return Err(ConfigError::Message(
                "generation.workers must be at least 1".to_string(),
            ));
        }

        if self.database.backend == StorageBackend::Postgres && self.database.url.is_none() {
            return Err(ConfigError::Message(
                "database.url is required for the postgres backend".to_string(),
            ));
        }

        if self.queue.backend == QueueBackend::Sqs {
            if self.queue.generation_queue_url.is_none() {
                return Err(ConfigError::Message(
                    "queue.generation_queue_url is required for the sqs backend".to_string(),
                ));
            }

            // A message must stay invisible for as long as an attempt may run,
            // otherwise SQS hands it to a second worker mid-pipeline.
            if self.queue.visibility_timeout_secs < self.generation.max_run_time_secs {
                return Err(ConfigError::Message(format!(
                    "queue.visibility_timeout_secs ({}) must not be shorter than generation.max_run_time_secs ({})",
                    self.queue.visibility_timeout_secs, self.generation.max_run_time_secs
                )));
            }
        }

        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> Option<&str> {
        self.database
            .read_url
            .as_deref()
            .or(self.database.url.as_deref())
    }
}
