//! Outcome events for settled transfers
//!
//! A terminal `transfer_out` row carries an `event_published_at` marker
//! once its `transfer.completed` / `transfer.failed` event was accepted by
//! the bus. Publishing happens before marking, so a crash in between only
//! causes a duplicate event, never a lost one.

use event_bus::{DomainEvent, EventSink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wallet_ledger::{Ledger, Transaction, TransactionStatus, TransactionType};

use crate::Result;

/// Fallback reason when a failed row has none recorded
const UNKNOWN_REASON: &str = "transfer failed";

/// The outcome event for `tx`, or `None` if it is not a settled transfer
pub fn outcome_event(tx: &Transaction) -> Option<DomainEvent> {
    if tx.kind != TransactionType::TransferOut || tx.status == TransactionStatus::Pending {
        return None;
    }

    let from_user_id = tx.from_id.unwrap_or(tx.user_id);
    let to_user_id = match tx.to_id {
        Some(id) => id,
        None => {
            error!(transaction_id = %tx.id, "Transfer has no recipient, no outcome emitted");
            return None;
        }
    };

    match tx.status {
        TransactionStatus::Pending => None,
        TransactionStatus::Completed => Some(DomainEvent::transfer_completed(
            tx.id,
            from_user_id,
            to_user_id,
            tx.amount,
        )),
        TransactionStatus::Failed | TransactionStatus::Expired => {
            let reason = tx
                .failure_reason
                .clone()
                .unwrap_or_else(|| UNKNOWN_REASON.to_string());
            Some(DomainEvent::transfer_failed(
                tx.id,
                from_user_id,
                to_user_id,
                tx.amount,
                reason,
            ))
        }
    }
}

/// Publish the outcome of `tx` if it has not been published yet, then mark
/// it. Returns whether an event was published.
pub async fn publish_outcome<S>(
    ledger: &Ledger,
    events: &S,
    cancel: &CancellationToken,
    tx: &Transaction,
) -> Result<bool>
where
    S: EventSink + ?Sized,
{
    if tx.event_published_at.is_some() {
        debug!(transaction_id = %tx.id, "Outcome already published");
        return Ok(false);
    }

    let event = match outcome_event(tx) {
        Some(event) => event,
        None => return Ok(false),
    };

    events.publish(cancel, event.routing_key(), &event).await?;
    ledger.mark_event_published(tx.id).await?;

    info!(
        transaction_id = %tx.id,
        event_id = %event.event_id,
        routing_key = event.routing_key(),
        "Outcome published"
    );
    Ok(true)
}
