//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use event_bus::RetryPolicy;
use saga::OrchestratorConfig;
use thiserror::Error;

/// A configuration variable that could not be parsed.
#[derive(Debug, Error)]
#[error("Invalid value '{value}' for {name}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

/// Server and orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON logs, anything else for text
/// - `DATABASE_URL`: PostgreSQL URL; in-memory stores when unset
/// - `SAGA_STEP_TIMEOUT_SECS` (default: `30`)
/// - `SAGA_SWEEP_INTERVAL_MS` (default: `1000`)
/// - `SAGA_PUBLISH_MAX_ATTEMPTS` (default: `5`)
/// - `SAGA_PUBLISH_INITIAL_BACKOFF_MS` (default: `50`)
/// - `SAGA_PUBLISH_MAX_BACKOFF_MS` (default: `2000`)
/// - `SAGA_CONFLICT_RETRIES` (default: `3`)
/// - `SAGA_BUS_PARTITIONS` (default: `8`)
/// - `SAGA_IDEMPOTENCY_RETENTION_SECS` (default: `3600`)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub step_timeout: Duration,
    pub sweep_interval: Duration,
    pub publish_max_attempts: u32,
    pub publish_initial_backoff: Duration,
    pub publish_max_backoff: Duration,
    pub conflict_retries: u32,
    pub bus_partitions: usize,
    pub idempotency_retention: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(name).map(|value| parse_var(name, value)).transpose()
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .map(|value| parse_var("PORT", value))
                .transpose()?
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            step_timeout: parse("SAGA_STEP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.step_timeout),
            sweep_interval: parse("SAGA_SWEEP_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            publish_max_attempts: lookup("SAGA_PUBLISH_MAX_ATTEMPTS")
                .map(|value| parse_var("SAGA_PUBLISH_MAX_ATTEMPTS", value))
                .transpose()?
                .unwrap_or(defaults.publish_max_attempts),
            publish_initial_backoff: parse("SAGA_PUBLISH_INITIAL_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_initial_backoff),
            publish_max_backoff: parse("SAGA_PUBLISH_MAX_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_max_backoff),
            conflict_retries: lookup("SAGA_CONFLICT_RETRIES")
                .map(|value| parse_var("SAGA_CONFLICT_RETRIES", value))
                .transpose()?
                .unwrap_or(defaults.conflict_retries),
            bus_partitions: lookup("SAGA_BUS_PARTITIONS")
                .map(|value| parse_var("SAGA_BUS_PARTITIONS", value))
                .transpose()?
                .unwrap_or(defaults.bus_partitions),
            idempotency_retention: parse("SAGA_IDEMPOTENCY_RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_retention),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff used for every publish.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_max_attempts.max(1),
            initial_backoff: self.publish_initial_backoff,
            max_backoff: self.publish_max_backoff,
            ..RetryPolicy::default()
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            step_timeout: self.step_timeout,
            sweep_interval: self.sweep_interval,
            conflict_retries: self.conflict_retries,
            publish_retry: self.retry_policy(),
            idempotency_retention: self.idempotency_retention,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { name, value })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            step_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(1000),
            publish_max_attempts: 5,
            publish_initial_backoff: Duration::from_millis(50),
            publish_max_backoff: Duration::from_millis(2000),
            conflict_retries: 3,
            bus_partitions: 8,
            idempotency_retention: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.step_timeout, Duration::from_secs(30));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap(), Config::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("SAGA_STEP_TIMEOUT_SECS", "5"),
            ("SAGA_PUBLISH_MAX_ATTEMPTS", "2"),
            ("SAGA_BUS_PARTITIONS", "16"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert!(config.log_json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
        assert_eq!(config.orchestrator().step_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(config.bus_partitions, 16);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = Config::from_lookup(lookup(&[("SAGA_CONFLICT_RETRIES", "lots")])).unwrap_err();
        assert_eq!(err.name, "SAGA_CONFLICT_RETRIES");
        assert_eq!(err.to_string(), "Invalid value 'lots' for SAGA_CONFLICT_RETRIES");
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
