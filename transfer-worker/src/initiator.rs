//! Request side of the transfer saga
//!
//! Records a movement as `pending` under its idempotency key and announces
//! it on the bus. Top-ups and payments have no counterparty to coordinate
//! with and are applied in place.

use event_bus::{DomainEvent, EventSink};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use wallet_ledger::{
    ApplyOutcome, Error as LedgerError, Ledger, NewTransaction, NewUser, Submission, Transaction,
    TransactionStatus, User, Wallet,
};

use crate::Result;

/// A client's transfer request
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Sender
    pub from_user_id: Uuid,
    /// Recipient
    pub to_user_id: Uuid,
    /// Amount to move
    pub amount: Decimal,
    /// Client idempotency key
    pub idempotency_key: Option<String>,
    /// Free-text description
    pub description: Option<String>,
}

impl TransferRequest {
    /// Request without key or description
    pub fn new(from_user_id: Uuid, to_user_id: Uuid, amount: Decimal) -> Self {
        Self {
            from_user_id,
            to_user_id,
            amount,
            idempotency_key: None,
            description: None,
        }
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn into_new_transaction(self) -> NewTransaction {
        let mut request = NewTransaction::transfer(self.from_user_id, self.to_user_id, self.amount);
        if let Some(key) = self.idempotency_key {
            request = request.with_idempotency_key(key);
        }
        if let Some(description) = self.description {
            request = request.with_description(description);
        }
        request
    }
}

/// Entry point for wallet-affecting requests
pub struct TransferService<S: ?Sized> {
    ledger: Ledger,
    events: Arc<S>,
}

impl<S: ?Sized> std::fmt::Debug for TransferService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferService").finish_non_exhaustive()
    }
}

impl<S> TransferService<S>
where
    S: EventSink + ?Sized,
{
    /// Service writing to `ledger` and announcing on `events`
    pub fn new(ledger: Ledger, events: Arc<S>) -> Self {
        Self { ledger, events }
    }

    /// Register a user with an empty wallet and announce `user.created`.
    ///
    /// The user exists once this returns; a failed announcement is logged
    /// and not reported.
    pub async fn register_user(
        &self,
        cancel: &CancellationToken,
        new_user: NewUser,
    ) -> Result<(User, Wallet)> {
        let (user, wallet) = self.ledger.register_user(new_user).await?;

        let event = DomainEvent::user_created(user.id, &user.email, &user.name);
        if let Err(e) = self.events.publish(cancel, event.routing_key(), &event).await {
            warn!(user_id = %user.id, error = %e, "Failed to announce new user");
        }

        Ok((user, wallet))
    }

    /// Record a pending transfer and publish `transfer.initiated`.
    ///
    /// A retried request with the same idempotency key returns the stored
    /// transaction. If it is still pending the announcement is repeated,
    /// since the first one may never have reached the bus; applying it
    /// twice is harmless.
    pub async fn initiate_transfer(
        &self,
        cancel: &CancellationToken,
        request: TransferRequest,
    ) -> Result<Submission> {
        let submission = self.ledger.submit(request.into_new_transaction()).await?;
        let tx = submission.transaction();

        if submission.is_duplicate() && tx.status != TransactionStatus::Pending {
            info!(
                transaction_id = %tx.id,
                status = %tx.status,
                "Duplicate transfer request, already settled"
            );
            return Ok(submission);
        }

        let event = match initiated_event(tx) {
            Some(event) => event,
            None => {
                error!(transaction_id = %tx.id, "Transfer has no recipient, not announced");
                return Err(LedgerError::Corrupt(format!(
                    "transfer {} has no recipient",
                    tx.id
                ))
                .into());
            }
        };
        self.events.publish(cancel, event.routing_key(), &event).await?;

        info!(
            transaction_id = %tx.id,
            event_id = %event.event_id,
            duplicate = submission.is_duplicate(),
            "Transfer initiated"
        );
        Ok(submission)
    }

    /// Credit a user's wallet
    pub async fn topup(
        &self,
        user_id: Uuid,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<Transaction> {
        let mut request = NewTransaction::topup(user_id, amount);
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }
        self.submit_and_apply(request).await
    }

    /// Debit a user's wallet in favour of a merchant
    pub async fn pay(
        &self,
        user_id: Uuid,
        merchant_id: impl Into<String>,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<Transaction> {
        let mut request = NewTransaction::payment(user_id, merchant_id, amount);
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }
        self.submit_and_apply(request).await
    }

    async fn submit_and_apply(&self, request: NewTransaction) -> Result<Transaction> {
        let submission = self.ledger.submit(request).await?;
        let id = submission.transaction().id;

        // A duplicate may still be pending if its first apply never ran
        let outcome = self.ledger.apply(id).await?;
        Ok(match outcome {
            ApplyOutcome::Completed(tx)
            | ApplyOutcome::Expired(tx)
            | ApplyOutcome::AlreadyFinal(tx) => tx,
            ApplyOutcome::Failed { transaction, .. } => transaction,
        })
    }
}

fn initiated_event(tx: &Transaction) -> Option<DomainEvent> {
    Some(DomainEvent::transfer_initiated(
        tx.id,
        tx.from_id.unwrap_or(tx.user_id),
        tx.to_id?,
        tx.amount,
    ))
}
