//! Transfer saga worker
//!
//! Wires the ledger to the event bus:
//! - `TransferService` records requests as `pending` and announces them
//! - `TransferInitiatedHandler` applies transfers and publishes outcomes
//! - `OutcomeAuditHandler` cross-checks outcome events against the ledger
//! - `Reaper` expires overdue transactions and re-sends lost outcomes
//! - `run_consumer` keeps a queue consumer alive across disconnects

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod audit;
pub mod config;
pub mod error;
pub mod handler;
pub mod initiator;
pub mod outcome;
pub mod reaper;
pub mod supervisor;

pub use audit::{AuditFinding, OutcomeAuditHandler};
pub use config::{ReconnectConfig, WorkerConfig};
pub use error::{Result, WorkerError};
pub use handler::TransferInitiatedHandler;
pub use initiator::{TransferRequest, TransferService};
pub use outcome::{outcome_event, publish_outcome};
pub use reaper::{ReapReport, Reaper};
pub use supervisor::{run_consumer, Backoff};
