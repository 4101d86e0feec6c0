//! Configuration module for Beacon.
//!
//! Configuration can be built in code with [`Config::new`] (the usual path
//! for an embedded SDK) or loaded from a TOML file with environment
//! variable substitution.
//!
//! # Example
//!
//! ```toml
//! project_key = "${BEACON_PROJECT_KEY}"
//! endpoint_base_url = "https://ingest.beacon.dev"
//! flush_interval_seconds = 10
//! max_batch_size = 25
//! log_level = "info"
//! ```
//!
//! Unknown keys are ignored so a newer config file keeps working against an
//! older SDK.

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};

/// Default collector endpoint base URL.
pub const DEFAULT_ENDPOINT_BASE_URL: &str = "https://ingest.beacon.dev";

/// Default seconds between periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL_SECS: f64 = 10.0;

/// Default queue-length watermark that forces a flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 25;

/// Default bound on a single dispatch attempt.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 30.0;

/// Configuration errors. Fatal to `Engine::init` — nothing starts when
/// configuration is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// SDK configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Project key used as the bearer token on every batch (required)
    #[serde(default)]
    pub project_key: String,

    /// Collector base URL; the batch path is appended to it
    #[serde(default = "default_endpoint")]
    pub endpoint_base_url: String,

    /// Mark batches as test traffic (e.g. when running inside the studio)
    #[serde(default)]
    pub studio_test_mode: bool,

    /// Seconds between periodic flushes (positive)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: f64,

    /// Queue-length watermark that triggers an immediate flush (positive)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Bound on a single dispatch attempt, in seconds (positive)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,

    /// One of debug/info/warn/error. The SDK never installs a subscriber;
    /// the host feeds [`Config::log_level_filter`] to its own.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifier of the hosting experience, forwarded on every batch
    #[serde(default)]
    pub experience_id: i64,

    /// Identifier of the hosting place, forwarded on every batch
    #[serde(default)]
    pub place_id: i64,

    /// Identifier of this server instance; generated when not supplied
    #[serde(default = "default_instance_id")]
    pub server_instance_id: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT_BASE_URL.to_string()
}

fn default_flush_interval() -> f64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_request_timeout() -> f64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Config {
    /// Build a configuration with defaults for everything but the key.
    pub fn new(project_key: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            endpoint_base_url: default_endpoint(),
            studio_test_mode: false,
            flush_interval_seconds: default_flush_interval(),
            max_batch_size: default_max_batch_size(),
            request_timeout_seconds: default_request_timeout(),
            log_level: default_log_level(),
            experience_id: 0,
            place_id: 0,
            server_instance_id: default_instance_id(),
        }
    }

    /// Set the collector base URL.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_base_url = url.into();
        self
    }

    /// Set the periodic flush interval.
    pub fn with_flush_interval(mut self, seconds: f64) -> Self {
        self.flush_interval_seconds = seconds;
        self
    }

    /// Set the queue-length watermark.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the per-dispatch timeout.
    pub fn with_request_timeout(mut self, seconds: f64) -> Self {
        self.request_timeout_seconds = seconds;
        self
    }

    /// Mark all batches from this process as test traffic.
    pub fn with_test_mode(mut self, enabled: bool) -> Self {
        self.studio_test_mode = enabled;
        self
    }

    /// Set the experience and place identifiers forwarded on batches.
    pub fn with_environment(mut self, experience_id: i64, place_id: i64) -> Self {
        self.experience_id = experience_id;
        self.place_id = place_id;
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// `${VAR}` placeholders are substituted from the environment before
    /// parsing; unset variables are kept verbatim.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!(
            endpoint = %config.endpoint_base_url,
            flush_interval_seconds = config.flush_interval_seconds,
            max_batch_size = config.max_batch_size,
            test_mode = config.studio_test_mode,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_key.trim().is_empty() {
            return Err(ConfigError::MissingField("project_key".to_string()));
        }

        if !self.endpoint_base_url.starts_with("http://")
            && !self.endpoint_base_url.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(format!(
                "endpoint_base_url must start with http:// or https://, got '{}'",
                self.endpoint_base_url
            )));
        }

        if !self.flush_interval_seconds.is_finite() || self.flush_interval_seconds <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "flush_interval_seconds must be a positive number, got {}",
                self.flush_interval_seconds
            )));
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_batch_size must be a positive integer".to_string(),
            ));
        }

        if !self.request_timeout_seconds.is_finite() || self.request_timeout_seconds <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "request_timeout_seconds must be a positive number, got {}",
                self.request_timeout_seconds
            )));
        }

        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "log_level must be one of debug/info/warn/error, got '{}'",
                    other
                )));
            }
        }

        Ok(())
    }

    /// The configured log level as a `tracing` filter.
    ///
    /// For the host to apply when installing its subscriber, e.g.
    /// `tracing_subscriber::fmt().with_max_level(config.log_level_filter())`.
    pub fn log_level_filter(&self) -> LevelFilter {
        match self.log_level.as_str() {
            "debug" => LevelFilter::DEBUG,
            "warn" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        }
    }

    /// Periodic flush interval as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_seconds)
    }

    /// Per-dispatch timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_seconds)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
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

    #[test]
    fn test_env_var_substitution() {
        env::set_var("BEACON_TEST_VAR", "substituted_value");
        let input = "project_key = \"${BEACON_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "project_key = \"substituted_value\"");
        env::remove_var("BEACON_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "project_key = \"${BEACON_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "project_key = \"${BEACON_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_defaults() {
        let config = Config::new("pk_test");
        assert_eq!(config.endpoint_base_url, DEFAULT_ENDPOINT_BASE_URL);
        assert_eq!(config.flush_interval_seconds, 10.0);
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.request_timeout_seconds, 30.0);
        assert_eq!(config.log_level, "info");
        assert!(!config.studio_test_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            project_key = "pk_live_abc"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.project_key, "pk_live_abc");
        assert_eq!(config.max_batch_size, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let toml = r#"
            project_key = "pk_test"
            some_future_knob = 42
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_project_key_rejected() {
        let config = Config::new("");
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let config = Config::new("pk_test").with_endpoint("not-a-url");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nonpositive_numbers_rejected() {
        assert!(Config::new("pk_test")
            .with_flush_interval(0.0)
            .validate()
            .is_err());
        assert!(Config::new("pk_test")
            .with_max_batch_size(0)
            .validate()
            .is_err());
        assert!(Config::new("pk_test")
            .with_request_timeout(-1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::new("pk_test");
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_filter_mapping() {
        let mut config = Config::new("pk_test");
        assert_eq!(config.log_level_filter(), LevelFilter::INFO);

        config.log_level = "debug".to_string();
        assert_eq!(config.log_level_filter(), LevelFilter::DEBUG);
        config.log_level = "warn".to_string();
        assert_eq!(config.log_level_filter(), LevelFilter::WARN);
        config.log_level = "error".to_string();
        assert_eq!(config.log_level_filter(), LevelFilter::ERROR);
    }

    #[test]
    fn test_generated_instance_id_is_unique() {
        let a = Config::new("pk_test");
        let b = Config::new("pk_test");
        assert_ne!(a.server_instance_id, b.server_instance_id);
    }

    #[test]
    fn test_durations() {
        let config = Config::new("pk_test")
            .with_flush_interval(2.5)
            .with_request_timeout(0.25);
        assert_eq!(config.flush_interval(), Duration::from_millis(2500));
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
    }
}
