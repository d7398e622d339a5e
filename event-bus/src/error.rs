//! Error types for the event bus

use thiserror::Error;

/// Event bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Bus unreachable or connect timed out
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream or consumer declaration failed
    #[error("Declaration error: {0}")]
    Declaration(String),

    /// Single publish failed (transport, timeout or missing persistence ack)
    #[error("Publish error: {0}")]
    Publish(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller cancelled before the operation completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Delivery stream closed or failed while consuming
    #[error("Consume transport error: {0}")]
    ConsumeTransport(String),

    /// Ack, nak or term could not be sent
    #[error("Acknowledgement error: {0}")]
    Acknowledge(String),

    /// Malformed routing key, pattern or queue name
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors where the same publish may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Publish(_) | Error::Cancelled | Error::ConsumeTransport(_)
        )
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
