//! Event publisher
//!
//! Publishes JSON-encoded domain events to the topic exchange and waits for
//! the stream's persistence acknowledgement, never for a consumer.

use async_nats::{jetstream::Context as JetStreamContext, HeaderMap};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    events::DomainEvent,
    metrics::{EVENT_PUBLISH_DURATION, EVENT_PUBLISH_TOTAL},
    topology, BusConfig, Error, Result,
};

/// Message ID header, also used by JetStream for de-duplication
pub const HEADER_MESSAGE_ID: &str = "Nats-Msg-Id";
/// Body encoding header
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Emission timestamp header
pub const HEADER_EMITTED_AT: &str = "Emitted-At";

/// Anything that can put a domain event on the bus
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish `event` under `routing_key`. A cancelled publish is a failed
    /// publish; the caller decides whether to retry.
    async fn publish(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        event: &DomainEvent,
    ) -> Result<()>;
}

/// JetStream-backed publisher
pub struct EventPublisher {
    client: async_nats::Client,
    context: JetStreamContext,
    exchange: String,
    publish_timeout: Duration,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("exchange", &self.exchange)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl EventPublisher {
    /// Connect and declare the exchange (and its dead-letter stream)
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        config.validate()?;

        let (client, context) = topology::connect(config).await?;
        topology::declare_exchange(&context, &config.exchange).await?;
        topology::declare_dead_letter_stream(&context, &config.exchange).await?;

        info!(exchange = %config.exchange, "Event publisher ready");

        Ok(Self {
            client,
            context,
            exchange: config.exchange.clone(),
            publish_timeout: config.publish_timeout(),
        })
    }

    /// Exchange this publisher writes to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Flush buffered messages and release the connection
    pub async fn close(self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Connection(format!("Flush failed: {}", e)))?;

        info!(exchange = %self.exchange, "Event publisher closed");
        Ok(())
    }

    async fn publish_once(&self, routing_key: &str, event: &DomainEvent) -> Result<()> {
        let payload = event.to_vec()?;
        let subject = topology::subject(&self.exchange, routing_key);

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_MESSAGE_ID, Uuid::new_v4().to_string().as_str());
        headers.insert(HEADER_CONTENT_TYPE, "application/json");
        headers.insert(
            HEADER_EMITTED_AT,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true).as_str(),
        );

        let ack = self
            .context
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        // Persistence acknowledgement from the stream
        ack.await.map_err(|e| Error::Publish(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        event: &DomainEvent,
    ) -> Result<()> {
        topology::validate_routing_key(routing_key)?;
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(self.publish_timeout, self.publish_once(routing_key, event)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(Error::Publish(format!(
                        "no persistence ack within {:?}",
                        self.publish_timeout
                    ))),
                }
            }
        };

        EVENT_PUBLISH_DURATION
            .with_label_values(&[routing_key])
            .observe(start.elapsed().as_secs_f64());

        let status = if result.is_ok() { "success" } else { "error" };
        EVENT_PUBLISH_TOTAL
            .with_label_values(&[routing_key, status])
            .inc();

        match &result {
            Ok(()) => info!(
                routing_key,
                event_id = %event.event_id,
                exchange = %self.exchange,
                "Event published"
            ),
            Err(e) => error!(
                routing_key,
                event_id = %event.event_id,
                error = %e,
                "Event publish failed"
            ),
        }

        result
    }
}
