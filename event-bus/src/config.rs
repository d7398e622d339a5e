//! Bus configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{topology, Error, Result};

/// Connection and delivery settings shared by publishers and consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// NATS server URL
    pub url: String,

    /// Topic exchange name
    pub exchange: String,

    /// Client connection name
    pub client_name: String,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Wait for the persistence ack (milliseconds)
    pub publish_timeout_ms: u64,

    /// Redelivery delay for unacknowledged deliveries (milliseconds)
    pub ack_wait_ms: u64,

    /// Deliveries before a message is dead-lettered
    pub max_deliver: i64,

    /// Bound on a single handler invocation (milliseconds)
    pub processing_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            exchange: "wallet.events".to_string(),
            client_name: "wallet-platform".to_string(),
            connect_timeout_ms: 5_000,
            publish_timeout_ms: 5_000,
            ack_wait_ms: 60_000,
            max_deliver: 5,
            processing_timeout_ms: 30_000,
        }
    }
}

impl BusConfig {
    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Publish timeout
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Ack wait
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Processing timeout
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        let config: BusConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = BusConfig::default();

        if let Ok(url) = std::env::var("NATS_URL") {
            config.url = url;
        }
        if let Ok(exchange) = std::env::var("EVENT_EXCHANGE") {
            config.exchange = exchange;
        }
        if let Ok(value) = std::env::var("BUS_MAX_DELIVER") {
            config.max_deliver = parse_env("BUS_MAX_DELIVER", &value)?;
        }
        if let Ok(value) = std::env::var("BUS_ACK_WAIT_MS") {
            config.ack_wait_ms = parse_env("BUS_ACK_WAIT_MS", &value)?;
        }
        if let Ok(value) = std::env::var("BUS_PROCESSING_TIMEOUT_MS") {
            config.processing_timeout_ms = parse_env("BUS_PROCESSING_TIMEOUT_MS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bus cannot run with
    pub fn validate(&self) -> Result<()> {
        topology::validate_routing_key(&self.exchange)?;

        if self.max_deliver < 1 {
            return Err(Error::Config("max_deliver must be >= 1".to_string()));
        }
        // A handler still running when ack_wait lapses would see its own
        // message redelivered in parallel.
        if self.ack_wait_ms <= self.processing_timeout_ms {
            return Err(Error::Config(
                "ack_wait_ms must exceed processing_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// A durable queue bound to the exchange under a routing-key pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    /// Durable queue name
    pub queue: String,

    /// Topic pattern (`*` one token, trailing `#` the rest)
    pub routing_key_pattern: String,

    /// Maximum unacknowledged deliveries outstanding
    pub prefetch: usize,
}

impl QueueBinding {
    /// Validated binding
    pub fn new(
        queue: impl Into<String>,
        routing_key_pattern: impl Into<String>,
        prefetch: usize,
    ) -> Result<Self> {
        let binding = Self {
            queue: queue.into(),
            routing_key_pattern: routing_key_pattern.into(),
            prefetch,
        };
        binding.validate()?;
        Ok(binding)
    }

    /// Check queue name, pattern and prefetch
    pub fn validate(&self) -> Result<()> {
        topology::validate_queue_name(&self.queue)?;
        topology::pattern_to_filter(&self.routing_key_pattern)?;
        if self.prefetch == 0 {
            return Err(Error::Config("prefetch must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name} has invalid value {value:?}")))
}
