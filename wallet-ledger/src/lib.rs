//! Wallet Ledger Core
//!
//! Relational store of record for users, wallets, transactions and access
//! tokens, plus the guard that makes every wallet mutation safe under
//! concurrency and redelivery.
//!
//! # Architecture
//!
//! - **Store of record**: SQLite via sqlx, schema invariants enforced by the
//!   database (non-negative balances, unique `(user, idempotency key)`)
//! - **Optimistic concurrency**: version-checked conditional writes,
//!   retried on conflict with a bounded budget
//! - **Exactly-once effect**: a transaction's effect and its status change
//!   commit in one unit of work, so replaying an apply is a no-op
//!
//! # Invariants
//!
//! - Balances never go negative
//! - A transfer debits the sender and credits the recipient by the same
//!   amount, or neither
//! - A transaction leaves `pending` at most once and never changes after

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod metrics;
pub mod store;
pub mod tokens;
pub mod types;

// Re-exports
pub use config::{Config, RetryConfig};
pub use error::{Error, Result};
pub use guard::{retry_on_conflict, RetryPolicy};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use store::Store;
pub use tokens::token_digest;
pub use types::{
    AccessToken, ApplyOutcome, NewTransaction, NewUser, Rejection, Submission, Transaction,
    TransactionStatus, TransactionType, User, Wallet,
};
