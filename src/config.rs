//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `METERLINE_*` environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::storage::BufferConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub buffer: BufferSettings,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub geolocation: GeolocationConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Mutual TLS; when disabled the session is plain TCP
    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default = "default_ca_file")]
    pub ca_file: String,

    #[serde(default = "default_cert_file")]
    pub cert_file: String,

    #[serde(default = "default_key_file")]
    pub key_file: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Inbound messages queued between the session and the router
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "meterline".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ca_file() -> String {
    "certs/ca.pem".to_string()
}

fn default_cert_file() -> String {
    "certs/client.crt".to_string()
}

fn default_key_file() -> String {
    "certs/client.key".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_inbound_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            tls: default_true(),
            ca_file: default_ca_file(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Connection retry policy: `max_reconnect_attempts` tries in total
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_reconnect_attempts.max(1) - 1,
            Duration::from_millis(self.reconnect_interval_ms),
        )
    }
}

/// Topic names for each inbound stream and the control channel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicsConfig {
    #[serde(default = "default_events_topic")]
    pub events: String,

    #[serde(default = "default_config_topic")]
    pub config: String,

    #[serde(default = "default_sensor_topic")]
    pub sensor: String,

    #[serde(default = "default_feedback_topic")]
    pub feedback: String,

    /// Outbound control commands
    #[serde(default = "default_control_topic")]
    pub control: String,
}

fn default_events_topic() -> String {
    "apm/server".to_string()
}

fn default_config_topic() -> String {
    "apm/config".to_string()
}

fn default_sensor_topic() -> String {
    "esp32/data".to_string()
}

fn default_feedback_topic() -> String {
    "apm/feedback".to_string()
}

fn default_control_topic() -> String {
    "fan/control".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            events: default_events_topic(),
            config: default_config_topic(),
            sensor: default_sensor_topic(),
            feedback: default_feedback_topic(),
            control: default_control_topic(),
        }
    }
}

impl TopicsConfig {
    /// Topics the session subscribes to
    pub fn inbound(&self) -> Vec<String> {
        vec![
            self.events.clone(),
            self.config.clone(),
            self.sensor.clone(),
            self.feedback.clone(),
        ]
    }
}

/// Event store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("meterline").join("events.db").to_string_lossy().to_string())
        .unwrap_or_else(|| "./meterline_data/events.db".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl StorageConfig {
    /// Database path with a leading `~/` resolved against the home directory
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Write buffer configuration as it appears in the file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl BufferSettings {
    pub fn to_buffer_config(&self) -> BufferConfig {
        BufferConfig {
            batch_size: self.batch_size.max(1),
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Duplicate suppression configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DedupConfig {
    /// Recently accepted identities kept in memory
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

fn default_recent_capacity() -> usize {
    10_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
        }
    }
}

/// Cell-tower geolocation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeolocationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_geo_url")]
    pub url: String,

    /// API token; enrichment is skipped while empty
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_geo_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_geo_concurrency")]
    pub max_concurrent: usize,
}

fn default_geo_url() -> String {
    "https://unwiredlabs.com/v2/process.php".to_string()
}

fn default_geo_timeout() -> u64 {
    10_000
}

fn default_geo_concurrency() -> usize {
    8
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            url: default_geo_url(),
            token: String::new(),
            timeout_ms: default_geo_timeout(),
            max_concurrent: default_geo_concurrency(),
        }
    }
}

/// Observer-facing HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Frames queued per observer before alerts are skipped for it
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8085
}

fn default_max_sessions() -> usize {
    1000
}

fn default_session_buffer() -> usize {
    64
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_sessions: default_max_sessions(),
            session_buffer: default_session_buffer(),
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

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
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
            dirs::config_dir().map(|p| p.join("meterline").join("config.toml")),
            Some(PathBuf::from("/etc/meterline/config.toml")),
            Some(PathBuf::from("./config.toml")),
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
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Broker overrides
        if let Some(host) = lookup("METERLINE_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("METERLINE_BROKER_PORT").and_then(|p| p.parse().ok()) {
            self.broker.port = port;
        }
        if let Some(client_id) = lookup("METERLINE_BROKER_CLIENT_ID") {
            self.broker.client_id = client_id;
        }

        // Storage overrides
        if let Some(path) = lookup("METERLINE_DB_PATH") {
            self.storage.database_path = path;
        }

        // Geolocation overrides
        if let Some(token) = lookup("METERLINE_GEO_TOKEN") {
            self.geolocation.token = token;
        }

        // API overrides
        if let Some(host) = lookup("METERLINE_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("METERLINE_API_PORT").and_then(|p| p.parse().ok()) {
            self.api.port = port;
        }

        // Logging overrides
        if let Some(level) = lookup("METERLINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("METERLINE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    format!(
        r#"# Meterline Configuration
#
# Environment variables override these settings:
# - METERLINE_BROKER_HOST
# - METERLINE_BROKER_PORT
# - METERLINE_BROKER_CLIENT_ID
# - METERLINE_DB_PATH
# - METERLINE_GEO_TOKEN
# - METERLINE_API_HOST
# - METERLINE_API_PORT
# - METERLINE_LOG_LEVEL
# - METERLINE_LOG_FORMAT

[broker]
host = "localhost"
port = 8883
client_id = "meterline"

# Mutual TLS (CA, client certificate, private key must be readable)
tls = true
ca_file = "certs/ca.pem"
cert_file = "certs/client.crt"
key_file = "certs/client.key"

# username = ""
# password = ""

keep_alive_secs = 60
connect_timeout_secs = 30

# Connection attempts before giving up, and the wait between them
max_reconnect_attempts = 5
reconnect_interval_ms = 5000

[topics]
events = "apm/server"
config = "apm/config"
sensor = "esp32/data"
feedback = "apm/feedback"
control = "fan/control"

[storage]
# SQLite database file (a leading ~/ means the home directory)
database_path = '{database_path}'

[buffer]
# Pending events that trigger an immediate flush
batch_size = 10

# Periodic flush (ms)
flush_interval_ms = 1000

# Retries after a failed bulk write, and the wait between them
max_retries = 3
retry_delay_ms = 1000

[dedup]
# Recently accepted event identities kept in memory
recent_capacity = 10000

[geolocation]
enabled = true
url = "https://unwiredlabs.com/v2/process.php"

# API token (prefer METERLINE_GEO_TOKEN)
token = ""

timeout_ms = 10000
max_concurrent = 8

[api]
host = "0.0.0.0"
port = 8085
cors_origins = []

# Maximum concurrent observer sessions
max_sessions = 1000

# Frames queued per observer; a slower observer misses alerts
session_buffer = 64

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#,
        database_path = default_database_path()
    )
}
