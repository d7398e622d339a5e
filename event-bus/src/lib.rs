//! Event bus over NATS JetStream
//!
//! Provides a durable topic exchange with:
//! - Domain events with a fixed JSON wire contract
//! - Publisher that waits for stream persistence, never for consumers
//! - Durable queues bound by routing-key pattern, bounded prefetch
//! - Explicit settlement of every delivery, with dead-letter routing
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod publisher;
pub mod topology;

pub use config::{BusConfig, QueueBinding};
pub use consumer::{EventConsumer, JetStreamDeadLetters};
pub use dispatch::{
    dispatch, release_ready, Acknowledger, DeadLetterSink, Delivery, DeliveryHandler,
    DispatchPolicy, Disposition, InboundMessage, Settlement,
};
pub use error::{Error, Result};
pub use events::{routing, DomainEvent, EventPayload};
pub use publisher::{EventPublisher, EventSink};
