//! `transfer.initiated` handler
//!
//! Applies the transfer through the ledger's idempotent `apply`, then
//! publishes the outcome. Every path ends in an explicit disposition:
//!
//! | situation                                  | disposition  |
//! |--------------------------------------------|--------------|
//! | undecodable body, wrong event, unknown tx  | dead-letter  |
//! | applied (or already final), outcome sent   | ack          |
//! | already final and outcome already marked   | ack (no-op)  |
//! | outcome publish failed                     | requeue      |
//! | transient ledger failure                   | requeue      |
//! | any other ledger failure                   | dead-letter  |

use async_trait::async_trait;
use event_bus::{routing, DeliveryHandler, Disposition, EventPayload, EventSink, InboundMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_ledger::{ApplyOutcome, Error as LedgerError, Ledger, TransactionType};

use crate::outcome::publish_outcome;

/// Guard-side consumer of `transfer.initiated`
pub struct TransferInitiatedHandler<S: ?Sized> {
    ledger: Ledger,
    events: Arc<S>,
    cancel: CancellationToken,
    requeue_delay: Duration,
}

impl<S: ?Sized> std::fmt::Debug for TransferInitiatedHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferInitiatedHandler")
            .field("requeue_delay", &self.requeue_delay)
            .finish()
    }
}

impl<S> TransferInitiatedHandler<S>
where
    S: EventSink + ?Sized + 'static,
{
    /// Handler publishing outcomes through `events`; `cancel` aborts an
    /// outcome publish on shutdown (the delivery is then requeued).
    pub fn new(
        ledger: Ledger,
        events: Arc<S>,
        cancel: CancellationToken,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            events,
            cancel,
            requeue_delay,
        }
    }

    async fn settle(&self, transaction_id: Uuid) -> Disposition {
        let tx = match self.ledger.transaction(transaction_id).await {
            Ok(tx) => tx,
            Err(e) => return self.ledger_failure(transaction_id, e),
        };
        if tx.kind != TransactionType::TransferOut {
            return Disposition::dead_letter(format!(
                "transaction {transaction_id} is a {} not a transfer",
                tx.kind
            ));
        }

        let outcome = match self.ledger.apply(transaction_id).await {
            Ok(outcome) => outcome,
            Err(e) => return self.ledger_failure(transaction_id, e),
        };

        match &outcome {
            ApplyOutcome::AlreadyFinal(tx) if tx.event_published_at.is_some() => {
                debug!(transaction_id = %tx.id, status = %tx.status, "Redelivery, nothing to do");
                return Disposition::Ack;
            }
            ApplyOutcome::AlreadyFinal(tx) => {
                info!(
                    transaction_id = %tx.id,
                    status = %tx.status,
                    "Already final, outcome not yet published"
                );
            }
            _ => {}
        }

        match publish_outcome(&self.ledger, self.events.as_ref(), &self.cancel, outcome.transaction())
            .await
        {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                // The effect is committed; the redelivery only republishes
                warn!(transaction_id = %transaction_id, error = %e, "Outcome publish failed");
                Disposition::requeue_after(self.requeue_delay)
            }
        }
    }

    fn ledger_failure(&self, transaction_id: Uuid, error: LedgerError) -> Disposition {
        match error {
            LedgerError::TransactionNotFound(_) => {
                Disposition::dead_letter(format!("unknown transaction {transaction_id}"))
            }
            e if e.is_transient() => {
                warn!(transaction_id = %transaction_id, error = %e, "Transient ledger failure");
                Disposition::requeue_after(self.requeue_delay)
            }
            e => Disposition::dead_letter(format!("ledger error: {e}")),
        }
    }
}

#[async_trait]
impl<S> DeliveryHandler for TransferInitiatedHandler<S>
where
    S: EventSink + ?Sized + 'static,
{
    async fn handle(&self, message: InboundMessage) -> Disposition {
        let event = match message.event() {
            Ok(event) => event,
            Err(e) => return Disposition::dead_letter(format!("undecodable event: {e}")),
        };

        let transaction_id = match event.payload {
            EventPayload::TransferInitiated { transaction_id, .. } => transaction_id,
            other => {
                return Disposition::dead_letter(format!(
                    "expected {}, got {}",
                    routing::TRANSFER_INITIATED,
                    other.event_type()
                ))
            }
        };

        debug!(
            transaction_id = %transaction_id,
            event_id = %event.event_id,
            delivery_count = message.delivery_count,
            "Handling transfer"
        );
        self.settle(transaction_id).await
    }
}
