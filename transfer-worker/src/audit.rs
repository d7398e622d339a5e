//! Outcome audit consumer, bound to `transfer.*`
//!
//! Cross-checks every transfer event against the ledger and logs it. Never
//! mutates state, so redeliveries are harmless.

use async_trait::async_trait;
use event_bus::{DeliveryHandler, Disposition, DomainEvent, EventPayload, InboundMessage};
use std::time::Duration;
use tracing::{info, warn};
use wallet_ledger::{Error as LedgerError, Ledger, TransactionStatus};

/// What the audit concluded about one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditFinding {
    /// Ledger agrees with the event
    Consistent,
    /// Ledger has not reached the state the event reports (yet)
    Mismatch {
        /// Status the event implies
        expected: &'static str,
        /// Status in the ledger
        actual: TransactionStatus,
    },
    /// Ledger has no such transaction
    Unknown,
    /// Event carries no transaction
    NotApplicable,
}

/// Read-only audit of transfer events
#[derive(Debug, Clone)]
pub struct OutcomeAuditHandler {
    ledger: Ledger,
    requeue_delay: Duration,
}

impl OutcomeAuditHandler {
    /// Auditor reading from `ledger`
    pub fn new(ledger: Ledger, requeue_delay: Duration) -> Self {
        Self {
            ledger,
            requeue_delay,
        }
    }

    /// Compare `event` with the ledger
    pub async fn audit(&self, event: &DomainEvent) -> wallet_ledger::Result<AuditFinding> {
        let transaction_id = match event.payload.transaction_id() {
            Some(id) => id,
            None => return Ok(AuditFinding::NotApplicable),
        };

        let tx = match self.ledger.transaction(transaction_id).await {
            Ok(tx) => tx,
            Err(LedgerError::TransactionNotFound(_)) => return Ok(AuditFinding::Unknown),
            Err(e) => return Err(e),
        };

        let consistent = match &event.payload {
            EventPayload::TransferInitiated { .. } => return Ok(AuditFinding::Consistent),
            EventPayload::TransferCompleted { .. } => tx.status == TransactionStatus::Completed,
            EventPayload::TransferFailed { .. } => {
                matches!(tx.status, TransactionStatus::Failed | TransactionStatus::Expired)
            }
            EventPayload::UserCreated { .. } => return Ok(AuditFinding::NotApplicable),
        };

        if consistent {
            Ok(AuditFinding::Consistent)
        } else {
            let expected = match &event.payload {
                EventPayload::TransferCompleted { .. } => "completed",
                _ => "failed",
            };
            Ok(AuditFinding::Mismatch {
                expected,
                actual: tx.status,
            })
        }
    }
}

#[async_trait]
impl DeliveryHandler for OutcomeAuditHandler {
    async fn handle(&self, message: InboundMessage) -> Disposition {
        let event = match message.event() {
            Ok(event) => event,
            Err(e) => return Disposition::dead_letter(format!("undecodable event: {e}")),
        };

        match self.audit(&event).await {
            Ok(AuditFinding::Mismatch { expected, actual }) => warn!(
                event_id = %event.event_id,
                event_type = event.payload.event_type(),
                expected,
                actual = %actual,
                "Event disagrees with ledger"
            ),
            Ok(AuditFinding::Unknown) => warn!(
                event_id = %event.event_id,
                event_type = event.payload.event_type(),
                "Event refers to an unknown transaction"
            ),
            Ok(_) => info!(
                event_id = %event.event_id,
                event_type = event.payload.event_type(),
                transaction_id = ?event.payload.transaction_id(),
                "Audited"
            ),
            Err(e) if e.is_transient() => {
                warn!(event_id = %event.event_id, error = %e, "Audit lookup failed, requeueing");
                return Disposition::requeue_after(self.requeue_delay);
            }
            Err(e) => return Disposition::dead_letter(format!("ledger error: {e}")),
        }

        Disposition::Ack
    }
}
