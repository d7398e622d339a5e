//! Topic-exchange topology on JetStream
//!
//! The exchange `E` is a persistent stream capturing `E.>`; routing key `k`
//! travels on subject `E.k`. A queue is a durable pull consumer on that
//! stream filtered by the translated routing-key pattern, so every queue
//! sees every matching message (limits retention, not work-queue).
//! Dead letters go to a separate stream capturing `dlq.E.>`.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType, Stream},
    Context as JetStreamContext,
};
use std::time::Duration;
use tracing::{error, info};

use crate::{BusConfig, Error, QueueBinding, Result};

/// Connect to NATS and open a JetStream context, failing fast on timeout
pub async fn connect(config: &BusConfig) -> Result<(async_nats::Client, JetStreamContext)> {
    info!(url = %config.url, exchange = %config.exchange, "Connecting to NATS JetStream");

    let connecting = async_nats::ConnectOptions::new()
        .name(&config.client_name)
        .connection_timeout(config.connect_timeout())
        .connect(config.url.as_str());

    let client = tokio::time::timeout(config.connect_timeout(), connecting)
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "timed out after {:?} connecting to {}",
                config.connect_timeout(),
                config.url
            ))
        })?
        .map_err(|e| Error::Connection(e.to_string()))?;

    let context = jetstream::new(client.clone());
    Ok((client, context))
}

/// Declare the exchange stream. Idempotent.
pub async fn declare_exchange(context: &JetStreamContext, exchange: &str) -> Result<Stream> {
    let stream_name = stream_name(exchange);

    let config = StreamConfig {
        name: stream_name.clone(),
        description: Some(format!("Topic exchange {}", exchange)),
        subjects: vec![format!("{}.>", exchange)],
        retention: RetentionPolicy::Limits,
        storage: StorageType::File,
        max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
        duplicate_window: Duration::from_secs(120),
        ..Default::default()
    };

    match context.get_or_create_stream(config).await {
        Ok(stream) => {
            info!(stream = %stream_name, "Exchange stream ready");
            Ok(stream)
        }
        Err(e) => {
            error!(stream = %stream_name, error = %e, "Failed to declare exchange stream");
            Err(Error::Declaration(e.to_string()))
        }
    }
}

/// Declare the dead-letter stream for an exchange. Idempotent.
pub async fn declare_dead_letter_stream(
    context: &JetStreamContext,
    exchange: &str,
) -> Result<Stream> {
    let stream_name = dead_letter_stream_name(exchange);

    let config = StreamConfig {
        name: stream_name.clone(),
        description: Some("Dead-lettered deliveries".to_string()),
        subjects: vec![format!("dlq.{}.>", exchange)],
        retention: RetentionPolicy::Limits,
        storage: StorageType::File,
        max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
        ..Default::default()
    };

    match context.get_or_create_stream(config).await {
        Ok(stream) => {
            info!(stream = %stream_name, "Dead-letter stream ready");
            Ok(stream)
        }
        Err(e) => {
            error!(stream = %stream_name, error = %e, "Failed to declare dead-letter stream");
            Err(Error::Declaration(e.to_string()))
        }
    }
}

/// Declare a durable queue bound under the binding's pattern. Idempotent.
pub async fn declare_queue(
    stream: &Stream,
    config: &BusConfig,
    binding: &QueueBinding,
) -> Result<PullConsumer> {
    let filter_subject = format!(
        "{}.{}",
        config.exchange,
        pattern_to_filter(&binding.routing_key_pattern)?
    );

    let consumer_config = pull::Config {
        durable_name: Some(binding.queue.clone()),
        description: Some(format!("Queue bound to {}", binding.routing_key_pattern)),
        filter_subject: filter_subject.clone(),
        ack_policy: AckPolicy::Explicit,
        ack_wait: config.ack_wait(),
        max_deliver: config.max_deliver,
        max_ack_pending: binding.prefetch as i64,
        deliver_policy: DeliverPolicy::All,
        ..Default::default()
    };

    let consumer = stream
        .get_or_create_consumer(&binding.queue, consumer_config)
        .await
        .map_err(|e| Error::Declaration(e.to_string()))?;

    info!(
        queue = %binding.queue,
        filter = %filter_subject,
        prefetch = binding.prefetch,
        "Queue bound"
    );
    Ok(consumer)
}

/// Stream name for an exchange: upper-cased, `.` and `-` become `_`
pub fn stream_name(exchange: &str) -> String {
    exchange.replace(&['.', '-'][..], "_").to_uppercase()
}

/// Stream name for an exchange's dead letters
pub fn dead_letter_stream_name(exchange: &str) -> String {
    format!("{}_DLQ", stream_name(exchange))
}

/// Subject a routing key is published on
pub fn subject(exchange: &str, routing_key: &str) -> String {
    format!("{}.{}", exchange, routing_key)
}

/// Subject a dead-lettered delivery is republished on
pub fn dead_letter_subject(exchange: &str, routing_key: &str) -> String {
    format!("dlq.{}.{}", exchange, routing_key)
}

/// Routing key carried by a subject of this exchange
pub fn routing_key_from_subject<'a>(exchange: &str, subject: &'a str) -> Option<&'a str> {
    subject
        .strip_prefix(exchange)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|key| !key.is_empty())
}

/// Translate a topic pattern into a NATS filter. `*` is kept; a trailing
/// `#` becomes `>`. `#` anywhere else has no NATS equivalent.
pub fn pattern_to_filter(pattern: &str) -> Result<String> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;

    let mut translated = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => {
                return Err(Error::InvalidTopology(format!(
                    "empty token in pattern {pattern:?}"
                )))
            }
            "#" if i == last => translated.push(">"),
            "#" => {
                return Err(Error::InvalidTopology(format!(
                    "'#' must be the final token in {pattern:?}"
                )))
            }
            "*" => translated.push("*"),
            t if t.contains(&['*', '#', '>'][..]) || t.contains(char::is_whitespace) => {
                return Err(Error::InvalidTopology(format!(
                    "invalid token {t:?} in pattern {pattern:?}"
                )))
            }
            t => translated.push(t),
        }
    }

    Ok(translated.join("."))
}

/// A literal routing key: non-empty dot-separated tokens, no wildcards
pub fn validate_routing_key(routing_key: &str) -> Result<()> {
    let valid = routing_key.split('.').all(|token| {
        !token.is_empty()
            && !token.contains(&['*', '#', '>'][..])
            && !token.contains(char::is_whitespace)
    });

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTopology(format!("invalid routing key {routing_key:?}")))
    }
}

/// Queue names become durable consumer names
pub fn validate_queue_name(queue: &str) -> Result<()> {
    let valid = !queue.is_empty()
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTopology(format!("invalid queue name {queue:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        assert_eq!(stream_name("wallet.events"), "WALLET_EVENTS");
        assert_eq!(stream_name("wallet-events"), "WALLET_EVENTS");
        assert_eq!(dead_letter_stream_name("wallet.events"), "WALLET_EVENTS_DLQ");
    }

    #[test]
    fn test_pattern_translation() {
        assert_eq!(pattern_to_filter("transfer.initiated").unwrap(), "transfer.initiated");
        assert_eq!(pattern_to_filter("transfer.*").unwrap(), "transfer.*");
        assert_eq!(pattern_to_filter("transfer.#").unwrap(), "transfer.>");
        assert_eq!(pattern_to_filter("#").unwrap(), ">");
        assert!(pattern_to_filter("#.failed").is_err());
        assert!(pattern_to_filter("transfer..failed").is_err());
        assert!(pattern_to_filter("transfer.>").is_err());
    }

    #[test]
    fn test_routing_key_round_trip_through_subject() {
        let subject = subject("wallet.events", "transfer.failed");
        assert_eq!(subject, "wallet.events.transfer.failed");
        assert_eq!(
            routing_key_from_subject("wallet.events", &subject),
            Some("transfer.failed")
        );
        assert_eq!(routing_key_from_subject("wallet.events", "wallet.eventsx.a"), None);
        assert_eq!(routing_key_from_subject("wallet.events", "wallet.events."), None);
    }

    #[test]
    fn test_routing_key_validation() {
        assert!(validate_routing_key("transfer.completed").is_ok());
        assert!(validate_routing_key("transfer.*").is_err());
        assert!(validate_routing_key("transfer.").is_err());
        assert!(validate_routing_key("").is_err());
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("transfer_processor-1").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("a.b").is_err());
    }
}
