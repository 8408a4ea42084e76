use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Settings shared by every service binary.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// How a service names itself in logs and traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub version: String,
    pub log_level: String,
    /// No endpoint keeps tracing local.
    pub otlp_endpoint: Option<String>,
}

impl ServiceIdentity {
    /// Reads `SERVICE_NAME`, `SERVICE_VERSION`, `LOG_LEVEL` and `OTLP_ENDPOINT`.
    pub fn from_env(default_name: &str, default_version: &str) -> Self {
        Self {
            name: env_or("SERVICE_NAME", default_name.to_string()),
            version: env_or("SERVICE_VERSION", default_version.to_string()),
            log_level: env_or("LOG_LEVEL", "info".to_string()),
            otlp_endpoint: optional_env("OTLP_ENDPOINT"),
        }
    }
}

/// Value of a variable the service cannot start without.
pub fn require_env(key: &str) -> Result<String, AppError> {
    optional_env(key).ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("{} is required", key)))
}

/// Value of `key`, treating an empty string as unset.
pub fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Parsed value of `key`, or `default` when unset or unparseable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    optional_env(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_variable_is_config_error() {
        let err = require_env("SERVICE_CORE_TEST_UNSET_REQUIRED").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("SERVICE_CORE_TEST_UNSET_REQUIRED"));
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        assert_eq!(env_or("SERVICE_CORE_TEST_UNSET_PORT", 8080u16), 8080);
        assert!(env_or("SERVICE_CORE_TEST_UNSET_FLAG", true));
        assert_eq!(optional_env("SERVICE_CORE_TEST_UNSET_URL"), None);
    }

    #[test]
    fn default_config_listens_on_8080() {
        assert_eq!(Config::default().port, 8080);
    }
}
