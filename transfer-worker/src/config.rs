//! Worker configuration

use event_bus::{routing, BusConfig, QueueBinding};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, WorkerError};

/// Top-level worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Ledger store
    pub ledger: wallet_ledger::Config,

    /// Bus connection and delivery limits
    pub bus: BusConfig,

    /// Durable queue bound to `transfer.initiated`
    pub transfer_queue: String,

    /// Durable queue bound to `transfer.*`
    pub audit_queue: String,

    /// Unacknowledged deliveries per queue
    pub prefetch: usize,

    /// Delay before a transiently failed delivery comes back (milliseconds)
    pub requeue_delay_ms: u64,

    /// Expiry reaper period (milliseconds)
    pub reaper_interval_ms: u64,

    /// Age before an unpublished outcome is swept by the reaper (milliseconds)
    pub outbox_grace_ms: u64,

    /// Consumer reconnect backoff
    pub reconnect: ReconnectConfig,
}

/// Exponential backoff between consumer reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Cap (milliseconds)
    pub max_delay_ms: u64,

    /// Growth per failed attempt
    pub backoff_multiplier: f64,

    /// Random spread, as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ledger: wallet_ledger::Config::default(),
            bus: BusConfig::default(),
            transfer_queue: "transfer-worker".to_string(),
            audit_queue: "transfer-audit".to_string(),
            prefetch: 16,
            requeue_delay_ms: 1_000,
            reaper_interval_ms: 30_000,
            outbox_grace_ms: 60_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl WorkerConfig {
    /// Delay before a requeued delivery is retried
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    /// Expiry reaper period
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Outbox sweep grace period
    pub fn outbox_grace(&self) -> Duration {
        Duration::from_millis(self.outbox_grace_ms)
    }

    /// Binding for the guard queue
    pub fn transfer_binding(&self) -> Result<QueueBinding> {
        Ok(QueueBinding::new(
            &self.transfer_queue,
            routing::TRANSFER_INITIATED,
            self.prefetch,
        )?)
    }

    /// Binding for the outcome audit queue
    pub fn audit_binding(&self) -> Result<QueueBinding> {
        Ok(QueueBinding::new(&self.audit_queue, "transfer.*", self.prefetch)?)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Config(format!("Failed to read config: {}", e)))?;
        let config: WorkerConfig = toml::from_str(&content)
            .map_err(|e| WorkerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = WorkerConfig {
            ledger: wallet_ledger::Config::from_env()?,
            bus: BusConfig::from_env()?,
            ..WorkerConfig::default()
        };

        if let Ok(queue) = std::env::var("TRANSFER_QUEUE") {
            config.transfer_queue = queue;
        }
        if let Ok(queue) = std::env::var("AUDIT_QUEUE") {
            config.audit_queue = queue;
        }
        if let Ok(value) = std::env::var("PREFETCH") {
            config.prefetch = parse_env("PREFETCH", &value)?;
        }
        if let Ok(value) = std::env::var("REQUEUE_DELAY_MS") {
            config.requeue_delay_ms = parse_env("REQUEUE_DELAY_MS", &value)?;
        }
        if let Ok(value) = std::env::var("REAPER_INTERVAL_MS") {
            config.reaper_interval_ms = parse_env("REAPER_INTERVAL_MS", &value)?;
        }
        if let Ok(value) = std::env::var("OUTBOX_GRACE_MS") {
            config.outbox_grace_ms = parse_env("OUTBOX_GRACE_MS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.bus.validate()?;
        self.transfer_binding()?;
        self.audit_binding()?;

        if self.transfer_queue == self.audit_queue {
            return Err(WorkerError::Config(
                "transfer_queue and audit_queue must differ".to_string(),
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err(WorkerError::Config("reaper_interval_ms must be > 0".to_string()));
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(WorkerError::Config(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| WorkerError::Config(format!("{name} has invalid value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer_binding().unwrap().routing_key_pattern, "transfer.initiated");
        assert_eq!(config.audit_binding().unwrap().routing_key_pattern, "transfer.*");
    }

    #[test]
    fn test_same_queue_twice_rejected() {
        let config = WorkerConfig {
            audit_queue: "transfer-worker".to_string(),
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_zero_prefetch_rejected() {
        let config = WorkerConfig {
            prefetch: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WorkerError::Bus(event_bus::Error::Config(_)))
        ));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: WorkerConfig = toml::from_str(
            r#"
            prefetch = 4

            [ledger]
            database_url = "sqlite://wallet.db"

            [bus]
            exchange = "payments.events"
            "#,
        )
        .unwrap();

        assert_eq!(config.prefetch, 4);
        assert_eq!(config.ledger.database_url, "sqlite://wallet.db");
        assert_eq!(config.bus.exchange, "payments.events");
        assert_eq!(config.transfer_queue, "transfer-worker");
        assert_eq!(config.reaper_interval(), Duration::from_secs(30));
    }
}
