//! Error types for the transfer worker

use thiserror::Error;

/// Worker error
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Ledger store failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] wallet_ledger::Error),

    /// Bus failure
    #[error("Bus error: {0}")]
    Bus(#[from] event_bus::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Whether retrying the same work later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Ledger(e) => e.is_transient(),
            WorkerError::Bus(e) => e.is_retryable(),
            WorkerError::Config(_) => false,
        }
    }
}

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;
