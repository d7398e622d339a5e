//! Event consumer over JetStream
//!
//! Binds a durable queue to the exchange and feeds each delivery through
//! [`dispatch`]. The prefetch limit is the consumer's `max_ack_pending`, so
//! the server never has more than that many unsettled deliveries out.

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind, Context as JetStreamContext};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dispatch::{
        dispatch, release_ready, Acknowledger, DeadLetterSink, Delivery, DeliveryHandler,
        DispatchPolicy, InboundMessage,
    },
    publisher::{HEADER_CONTENT_TYPE, HEADER_MESSAGE_ID},
    topology, BusConfig, Error, QueueBinding, Result,
};

/// Reason a delivery was dead-lettered
pub const HEADER_DEAD_LETTER_REASON: &str = "Dead-Letter-Reason";
/// Routing key the message was originally published under
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "Original-Routing-Key";
/// Deliveries made before dead-lettering
pub const HEADER_DELIVERY_COUNT: &str = "Delivery-Count";
/// Message ID of the original publish
pub const HEADER_ORIGINAL_MESSAGE_ID: &str = "Original-Message-Id";

/// Settles a JetStream delivery
pub struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::Acknowledge(e.to_string()))
    }

    async fn nak(self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| Error::Acknowledge(e.to_string()))
    }

    async fn term(self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| Error::Acknowledge(e.to_string()))
    }
}

/// Republishes dead letters on `dlq.<exchange>.<routing key>`
#[derive(Clone)]
pub struct JetStreamDeadLetters {
    context: JetStreamContext,
    exchange: String,
}

impl JetStreamDeadLetters {
    /// Dead-letter sink for `exchange`
    pub fn new(context: JetStreamContext, exchange: impl Into<String>) -> Self {
        Self {
            context,
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for JetStreamDeadLetters {
    async fn dead_letter(&self, message: &InboundMessage, reason: &str) -> Result<()> {
        let subject = topology::dead_letter_subject(&self.exchange, &message.routing_key);

        // Header values are single-line
        let reason: String = reason
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_MESSAGE_ID, Uuid::new_v4().to_string().as_str());
        headers.insert(HEADER_CONTENT_TYPE, "application/json");
        headers.insert(HEADER_DEAD_LETTER_REASON, reason.as_str());
        headers.insert(HEADER_ORIGINAL_ROUTING_KEY, message.routing_key.as_str());
        headers.insert(HEADER_DELIVERY_COUNT, message.delivery_count.to_string().as_str());
        if let Some(id) = &message.message_id {
            headers.insert(HEADER_ORIGINAL_MESSAGE_ID, id.as_str());
        }

        self.context
            .publish_with_headers(subject, headers, message.payload.clone())
            .await
            .map_err(|e| Error::Publish(e.to_string()))?
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        Ok(())
    }
}

/// Durable queue consumer
pub struct EventConsumer {
    consumer: PullConsumer,
    dead_letters: JetStreamDeadLetters,
    exchange: String,
    binding: QueueBinding,
    policy: DispatchPolicy,
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("exchange", &self.exchange)
            .field("binding", &self.binding)
            .field("policy", &self.policy)
            .finish()
    }
}

impl EventConsumer {
    /// Connect, declare the exchange and bind the queue
    pub async fn connect(config: &BusConfig, binding: QueueBinding) -> Result<Self> {
        config.validate()?;
        binding.validate()?;

        let (_client, context) = topology::connect(config).await?;
        let stream = topology::declare_exchange(&context, &config.exchange).await?;
        topology::declare_dead_letter_stream(&context, &config.exchange).await?;
        let consumer = topology::declare_queue(&stream, config, &binding).await?;

        let policy = DispatchPolicy {
            queue: binding.queue.clone(),
            processing_timeout: config.processing_timeout(),
            max_deliver: config.max_deliver as u64,
        };

        Ok(Self {
            consumer,
            dead_letters: JetStreamDeadLetters::new(context, &config.exchange),
            exchange: config.exchange.clone(),
            binding,
            policy,
        })
    }

    /// Queue binding
    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Deliver messages to `handler` until `cancel` fires (`Ok`) or the
    /// delivery stream fails or ends (`Err(ConsumeTransport)`).
    ///
    /// Cancellation is observed between deliveries; the delivery in flight
    /// is always settled first, and deliveries already pulled but not yet
    /// handled are nak'ed for immediate redelivery.
    pub async fn consume<H: DeliveryHandler>(
        &self,
        cancel: &CancellationToken,
        handler: Arc<H>,
    ) -> Result<()> {
        let mut messages = self
            .consumer
            .stream()
            .max_messages_per_batch(self.binding.prefetch)
            .messages()
            .await
            .map_err(|e| Error::ConsumeTransport(e.to_string()))?;

        info!(
            queue = %self.binding.queue,
            pattern = %self.binding.routing_key_pattern,
            prefetch = self.binding.prefetch,
            "Consuming"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = messages.next() => Some(next),
            };

            let message = match next {
                None => {
                    // Hand back what the last pull buffered instead of
                    // leaving it to ack_wait
                    let mut buffered = (&mut messages).filter_map(|item| {
                        futures::future::ready(item.ok().map(|message| JetStreamAcker { message }))
                    });
                    let released = release_ready(&mut buffered).await;
                    info!(
                        queue = %self.binding.queue,
                        released,
                        "Consumer cancelled, stopping"
                    );
                    return Ok(());
                }
                Some(Some(Ok(message))) => message,
                Some(Some(Err(e))) => return Err(Error::ConsumeTransport(e.to_string())),
                Some(None) => {
                    return Err(Error::ConsumeTransport(
                        "delivery stream closed".to_string(),
                    ))
                }
            };

            let delivery = self.to_delivery(message);
            if let Err(e) = dispatch(delivery, &handler, &self.dead_letters, &self.policy).await {
                // Unsettled deliveries come back after ack_wait
                warn!(queue = %self.binding.queue, error = %e, "Failed to settle delivery");
            }
        }
    }

    fn to_delivery(&self, message: jetstream::Message) -> Delivery<JetStreamAcker> {
        let subject = message.subject.to_string();
        let routing_key = topology::routing_key_from_subject(&self.exchange, &subject)
            .unwrap_or(&subject)
            .to_string();

        let message_id = message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(HEADER_MESSAGE_ID))
            .map(|value| value.as_str().to_string());

        let delivery_count = message
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .unwrap_or(1);

        let inbound = InboundMessage {
            routing_key,
            message_id,
            payload: message.payload.clone(),
            delivery_count,
        };

        Delivery {
            message: inbound,
            acker: JetStreamAcker { message },
        }
    }
}
