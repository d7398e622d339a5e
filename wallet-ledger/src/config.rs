//! Configuration for the ledger store

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite connection string
    pub database_url: String,

    /// Maximum pooled connections
    pub max_connections: u32,

    /// Pool acquire timeout (milliseconds)
    pub acquire_timeout_ms: u64,

    /// SQLite busy timeout (milliseconds)
    pub busy_timeout_ms: u64,

    /// Optimistic write retry budget
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 8,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry for the read-check-conditional-write loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before reporting `ConcurrencyExhausted`
    pub max_attempts: u32,

    /// First backoff delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 2,
            max_delay_ms: 50,
        }
    }
}

impl Config {
    /// Config for a database at `url`, other settings default
    pub fn with_database_url(url: impl Into<String>) -> Self {
        Self {
            database_url: url.into(),
            ..Self::default()
        }
    }

    /// Pool acquire timeout
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// SQLite busy timeout
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database_url = url;
            }
        }

        if let Ok(value) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = parse_env("DATABASE_MAX_CONNECTIONS", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_MAX_WRITE_ATTEMPTS") {
            config.retry.max_attempts = parse_env("LEDGER_MAX_WRITE_ATTEMPTS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(crate::Error::Config("max_connections must be > 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{name} has invalid value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.retry.max_attempts, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            database_url = "sqlite://ledger.db"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.database_url, "sqlite://ledger.db");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_delay_ms, 50);
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
