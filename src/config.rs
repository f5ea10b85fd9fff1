//! Configuration management for Ratewarden.
//!
//! Only the shared store and logging are configured externally. Limits,
//! windows and circuit thresholds are supplied in code at each call site.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Shared window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared (Redis) store configuration.
///
/// When `host` is unset the limiter runs with the in-process store only.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis host
    #[serde(default)]
    pub host: Option<String>,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis password
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Redis logical database
    #[serde(default)]
    pub db: i64,

    /// Prefix for every key written by the limiter
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for establishing the initial connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single store round trip, in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("key_prefix", &self.key_prefix)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("response_timeout_ms", &self.response_timeout_ms)
            .finish()
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "ratewarden:".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_response_timeout() -> u64 {
    500
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file and the environment.
    ///
    /// Precedence, lowest first: defaults, the file, `RATEWARDEN__*`
    /// variables (e.g. `RATEWARDEN__LOGGING__JSON=true`), then
    /// `REDIS_HOST`, `REDIS_PORT` and `REDIS_PASSWORD`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(RateLimitError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        builder
            .add_source(
                Environment::with_prefix("RATEWARDEN")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("store.host", std::env::var("REDIS_HOST").ok())
            .and_then(|b| b.set_override_option("store.port", std::env::var("REDIS_PORT").ok()))
            .and_then(|b| {
                b.set_override_option("store.password", std::env::var("REDIS_PASSWORD").ok())
            })
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RateLimitError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_store_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.store.host, None);
        assert_eq!(config.store.port, 6379);
        assert_eq!(config.store.key_prefix, "ratewarden:");
        assert_eq!(config.store.response_timeout(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_password_is_redacted() {
        let store = StoreConfig {
            password: Some("hunter2".to_string()),
            ..StoreConfig::default()
        };
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));

        let json = serde_json::to_string(&store).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ServiceConfig::load(Some(Path::new("/nonexistent/ratewarden.yaml"))).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "store:\n  port: 6380\n  key_prefix: \"test:\"\nlogging:\n  json: true"
        )
        .unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.key_prefix, "test:");
        assert!(config.logging.json);
        // REDIS_PORT may be set in the environment and takes precedence.
        if std::env::var("REDIS_PORT").is_err() {
            assert_eq!(config.store.port, 6380);
        }
    }
}
