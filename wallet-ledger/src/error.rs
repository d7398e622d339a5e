//! Error types for the wallet ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (SQLite)
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A storage-level constraint rejected the write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Request failed validation before reaching the store
    #[error("Invalid request: {0}")]
    Validation(String),

    /// User not found (or soft-deleted)
    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    /// Email already registered
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Wallet balance does not cover the debit
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount requested
        required: Decimal,
        /// Balance at the time of the check
        available: Decimal,
    },

    /// A conditional write lost against a concurrent mutation. Retryable.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The optimistic retry budget was spent without a successful write
    #[error("Concurrency retries exhausted after {attempts} attempts")]
    ConcurrencyExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// A stored row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures that may succeed if the whole request is retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Conflict(_) | Error::ConcurrencyExhausted { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_contention(&err) {
            return Error::Conflict(err.to_string());
        }

        if let sqlx::Error::Database(db) = &err {
            if db.is_check_violation() || db.is_foreign_key_violation() {
                return Error::ConstraintViolation(db.message().to_string());
            }
        }

        Error::Database(err)
    }
}

/// SQLite reports lost races as BUSY/LOCKED, including the extended
/// stale-snapshot codes. The primary code sits in the low byte.
fn is_lock_contention(err: &sqlx::Error) -> bool {
    const SQLITE_BUSY: i32 = 5;
    const SQLITE_LOCKED: i32 = 6;

    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}

/// True when the error is a unique-index violation
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Conflict("stale version".into()).is_transient());
        assert!(Error::ConcurrencyExhausted { attempts: 5 }.is_transient());
        assert!(!Error::InsufficientFunds {
            required: Decimal::from(40),
            available: Decimal::from(20),
        }
        .is_transient());
        assert!(!Error::Validation("amount".into()).is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_contention() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::Database(_)));
    }
}
