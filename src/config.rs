//! Configuration module for the relay.
//!
//! Loads configuration from a TOML file with environment variable
//! substitution. Secrets are normally injected through `${VAR}` placeholders.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [redis]
//! url = "redis://localhost:6379"
//!
//! [ingress]
//! shared_secret = "${STREAM_API_SECRET}"
//!
//! [sink]
//! url = "https://splunk.example.com:8088"
//! token = "${SPLUNK_HEC_TOKEN}"
//! verify_tls = true
//!
//! [queue]
//! name = "webhook_queue"
//!
//! [worker]
//! deduplication_window_seconds = 3600
//! poll_interval_ms = 1000
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::sink::{EventLabels, HecSink};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

/// Config file used when `RELAY_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    pub ingress: IngressConfig,

    pub sink: SinkConfig,

    pub queue: QueueConfig,

    pub worker: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Inbound webhook authentication
#[derive(Clone, Deserialize)]
pub struct IngressConfig {
    /// HMAC key for `X-Signature`
    pub shared_secret: String,
}

impl std::fmt::Debug for IngressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressConfig")
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

/// Downstream HEC configuration
#[derive(Clone, Deserialize)]
pub struct SinkConfig {
    /// Base URL of the collector
    pub url: String,

    pub token: String,

    pub verify_tls: bool,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Extra attempts on 5xx / network failure (0 = single attempt)
    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default = "default_sourcetype")]
    pub sourcetype: String,
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .field("timeout_ms", &self.timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("retries", &self.retries)
            .field("host", &self.host)
            .field("source", &self.source)
            .field("sourcetype", &self.sourcetype)
            .finish()
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_host() -> String {
    "hec-relay".to_string()
}

fn default_source() -> String {
    "webhook".to_string()
}

fn default_sourcetype() -> String {
    "_json".to_string()
}

impl SinkConfig {
    pub fn labels(&self) -> EventLabels {
        EventLabels {
            host: self.host.clone(),
            source: self.source.clone(),
            sourcetype: self.sourcetype.clone(),
        }
    }

    /// Build the HEC client described by this section.
    pub fn build_sink(&self) -> Result<HecSink, reqwest::Error> {
        HecSink::builder(&self.url, &self.token)
            .verify_tls(self.verify_tls)
            .timeout(Duration::from_millis(self.timeout_ms))
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .retries(self.retries)
            .labels(self.labels())
            .build()
    }
}

/// Queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub name: String,
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub deduplication_window_seconds: u64,

    pub poll_interval_ms: u64,

    /// Keep failed envelopes on `dead_letter:<queue>`
    #[serde(default)]
    pub dead_letter: bool,
}

impl RelayConfig {
    /// Load configuration from the default path or `RELAY_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        info!(
            queue = %config.queue.name,
            sink_url = %config.sink.url,
            dedup_window_secs = config.worker.deduplication_window_seconds,
            poll_interval_ms = config.worker.poll_interval_ms,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Substitute environment variables, parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: RelayConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        require_secret("ingress.shared_secret", &self.ingress.shared_secret)?;
        require_secret("sink.token", &self.sink.token)?;

        if !self.sink.url.starts_with("http://") && !self.sink.url.starts_with("https://") {
            return Err(ConfigError::ValidationError(
                "sink.url must start with http:// or https://".to_string(),
            ));
        }

        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "queue.name must not be empty".to_string(),
            ));
        }

        if self.worker.deduplication_window_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "worker.deduplication_window_seconds must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Secrets must be set and must not be an unsubstituted placeholder.
fn require_secret(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::ValidationError(format!("{} must not be empty", field)));
    }
    if value.contains("${") {
        return Err(ConfigError::ValidationError(format!(
            "{} contains an unset environment variable",
            field
        )));
    }
    Ok(())
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    placeholder_regex()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [ingress]
        shared_secret = "secret"

        [sink]
        url = "https://splunk:8088"
        token = "hec-token"
        verify_tls = false

        [queue]
        name = "webhook_queue"

        [worker]
        deduplication_window_seconds = 3600
        poll_interval_ms = 1000
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("RELAY_TEST_VAR", "substituted_value");
        let input = "token = \"${RELAY_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "token = \"substituted_value\"");
        env::remove_var("RELAY_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "token = \"${RELAY_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "token = \"${RELAY_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = RelayConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.ingress.shared_secret, "secret");
        assert_eq!(config.sink.url, "https://splunk:8088");
        assert!(!config.sink.verify_tls);
        assert_eq!(config.sink.timeout_ms, 10000);
        assert_eq!(config.sink.retries, 0);
        assert_eq!(config.queue.name, "webhook_queue");
        assert_eq!(config.worker.deduplication_window_seconds, 3600);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert!(!config.worker.dead_letter);
    }

    #[test]
    fn test_missing_required_section() {
        let toml = MINIMAL.replace("[queue]\n        name = \"webhook_queue\"", "");
        assert!(matches!(RelayConfig::parse(&toml), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_verify_tls_is_rejected() {
        let toml = MINIMAL.replace("verify_tls = false", "");
        assert!(matches!(RelayConfig::parse(&toml), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unsubstituted_secret_is_rejected() {
        let toml = MINIMAL.replace("\"secret\"", "\"${RELAY_UNSET_SECRET}\"");
        assert!(matches!(
            RelayConfig::parse(&toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_invalid_sink_url() {
        let toml = MINIMAL.replace("https://splunk:8088", "splunk:8088");
        assert!(matches!(
            RelayConfig::parse(&toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_dedup_window() {
        let toml = MINIMAL.replace("= 3600", "= 0");
        assert!(matches!(
            RelayConfig::parse(&toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = RelayConfig::load_from("/nonexistent/relay.toml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = RelayConfig::parse(MINIMAL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hec-token"));
        assert!(!debug.contains("\"secret\""));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_labels_from_config() {
        let config = RelayConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.sink.labels(), EventLabels::default());
    }
}
