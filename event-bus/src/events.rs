//! Domain events carried on the bus
//!
//! The JSON field names are a wire contract shared with other services:
//! `eventId`, `eventType`, `timestamp` on every event, plus the
//! variant-specific fields below. `eventType` doubles as the routing key.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Routing keys for the event types
pub mod routing {
    /// A user registered
    pub const USER_CREATED: &str = "user.created";
    /// A transfer was recorded as pending
    pub const TRANSFER_INITIATED: &str = "transfer.initiated";
    /// A transfer's funds moved
    pub const TRANSFER_COMPLETED: &str = "transfer.completed";
    /// A transfer was rejected or expired
    pub const TRANSFER_FAILED: &str = "transfer.failed";
}

/// Immutable notification of a state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Unique event ID
    pub event_id: Uuid,

    /// Emission time
    pub timestamp: DateTime<Utc>,

    /// Variant payload, tagged by `eventType`
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Closed set of event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventPayload {
    /// `user.created`
    #[serde(rename = "user.created", rename_all = "camelCase")]
    UserCreated {
        /// New user
        user_id: Uuid,
        /// Registered email
        email: String,
        /// Display name
        name: String,
    },

    /// `transfer.initiated`
    #[serde(rename = "transfer.initiated", rename_all = "camelCase")]
    TransferInitiated {
        /// Pending transaction
        transaction_id: Uuid,
        /// Sender
        from_user_id: Uuid,
        /// Recipient
        to_user_id: Uuid,
        /// Amount to move
        #[serde(with = "rust_decimal::serde::float")]
        amount: Decimal,
    },

    /// `transfer.completed`
    #[serde(rename = "transfer.completed", rename_all = "camelCase")]
    TransferCompleted {
        /// Completed transaction
        transaction_id: Uuid,
        /// Sender
        from_user_id: Uuid,
        /// Recipient
        to_user_id: Uuid,
        /// Amount moved
        #[serde(with = "rust_decimal::serde::float")]
        amount: Decimal,
    },

    /// `transfer.failed`
    #[serde(rename = "transfer.failed", rename_all = "camelCase")]
    TransferFailed {
        /// Failed transaction
        transaction_id: Uuid,
        /// Sender
        from_user_id: Uuid,
        /// Recipient
        to_user_id: Uuid,
        /// Amount that did not move
        #[serde(with = "rust_decimal::serde::float")]
        amount: Decimal,
        /// Why
        reason: String,
    },
}

impl EventPayload {
    /// The `eventType` tag, also used as routing key
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::UserCreated { .. } => routing::USER_CREATED,
            EventPayload::TransferInitiated { .. } => routing::TRANSFER_INITIATED,
            EventPayload::TransferCompleted { .. } => routing::TRANSFER_COMPLETED,
            EventPayload::TransferFailed { .. } => routing::TRANSFER_FAILED,
        }
    }

    /// Transaction the event refers to, if any
    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            EventPayload::UserCreated { .. } => None,
            EventPayload::TransferInitiated { transaction_id, .. }
            | EventPayload::TransferCompleted { transaction_id, .. }
            | EventPayload::TransferFailed { transaction_id, .. } => Some(*transaction_id),
        }
    }
}

impl DomainEvent {
    /// Wrap a payload with a fresh ID and the current time
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// `user.created`
    pub fn user_created(user_id: Uuid, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(EventPayload::UserCreated {
            user_id,
            email: email.into(),
            name: name.into(),
        })
    }

    /// `transfer.initiated`
    pub fn transfer_initiated(
        transaction_id: Uuid,
        from_user_id: Uuid,
        to_user_id: Uuid,
        amount: Decimal,
    ) -> Self {
        Self::new(EventPayload::TransferInitiated {
            transaction_id,
            from_user_id,
            to_user_id,
            amount,
        })
    }

    /// `transfer.completed`
    pub fn transfer_completed(
        transaction_id: Uuid,
        from_user_id: Uuid,
        to_user_id: Uuid,
        amount: Decimal,
    ) -> Self {
        Self::new(EventPayload::TransferCompleted {
            transaction_id,
            from_user_id,
            to_user_id,
            amount,
        })
    }

    /// `transfer.failed`
    pub fn transfer_failed(
        transaction_id: Uuid,
        from_user_id: Uuid,
        to_user_id: Uuid,
        amount: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(EventPayload::TransferFailed {
            transaction_id,
            from_user_id,
            to_user_id,
            amount,
            reason: reason.into(),
        })
    }

    /// Routing key this event is published under
    pub fn routing_key(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Serialize to JSON bytes
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
