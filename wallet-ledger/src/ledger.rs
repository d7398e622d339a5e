//! Main ledger orchestration layer
//!
//! Ties the store and the retry guard together into the operations every
//! wallet-affecting handler goes through:
//!
//! - [`Ledger::submit`] filters duplicate *requests* on
//!   `(user, idempotency key)`.
//! - [`Ledger::apply`] applies a pending transaction's effect exactly once:
//!   status check, balance writes and status transition share one unit of
//!   work, and the whole unit is retried when a conditional write loses.
//!
//! # Example
//!
//! ```no_run
//! use rust_decimal::Decimal;
//! use wallet_ledger::{Config, Ledger, NewTransaction, NewUser};
//!
//! #[tokio::main]
//! async fn main() -> wallet_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let (alice, _) = ledger
//!         .register_user(NewUser {
//!             name: "Alice".into(),
//!             email: "alice@example.com".into(),
//!             password_hash: "$2b$12$...".into(),
//!         })
//!         .await?;
//!
//!     let topup = ledger
//!         .submit(NewTransaction::topup(alice.id, Decimal::from(100)).with_idempotency_key("t-1"))
//!         .await?;
//!     ledger.apply(topup.transaction().id).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::{
    error::is_unique_violation,
    guard::{retry_on_conflict, RetryPolicy},
    metrics::Metrics,
    store::{self, Store},
    types::{
        ApplyOutcome, NewTransaction, NewUser, Rejection, Submission, Transaction,
        TransactionStatus, TransactionType, User, Wallet,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label used for balances entering from outside the platform
const SYSTEM_LABEL: &str = "system";

/// Idempotency key prefix of ledger-written `transfer_in` rows
const TRANSFER_IN_KEY_PREFIX: &str = "transfer-in:";

/// Whether the effect could be applied, or the business reason it could not
type Effect = std::result::Result<(), Rejection>;

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Store,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let store = Store::connect(&config).await?;
        let retry = RetryPolicy::from(&config.retry);
        Self::from_store(store, retry)
    }

    /// Build on an already-connected store
    pub fn from_store(store: Store, retry: RetryPolicy) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        Ok(Self {
            store,
            retry,
            metrics,
        })
    }

    /// Storage handle
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Close the store
    pub async fn close(&self) {
        self.store.close().await;
    }

    // -----------------------------------------------------------------------
    // Users and wallets
    // -----------------------------------------------------------------------

    /// Register a user together with an empty wallet, atomically
    pub async fn register_user(&self, new_user: NewUser) -> Result<(User, Wallet)> {
        let name = new_user.name.trim().to_string();
        let email = new_user.email.trim().to_lowercase();

        if name.is_empty() {
            return Err(Error::Validation("name must not be empty".to_string()));
        }
        if !email.contains('@') {
            return Err(Error::Validation(format!("invalid email {email:?}")));
        }
        if new_user.password_hash.is_empty() {
            return Err(Error::Validation("credential hash must not be empty".to_string()));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            name,
            email,
            password_hash: new_user.password_hash,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let wallet = Wallet {
            id: Uuid::new_v4(),
            user_id: user.id,
            balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.store.pool().begin().await?;
        if let Err(e) = store::insert_user(&mut tx, &user).await {
            if is_unique_violation(&e) {
                return Err(Error::EmailTaken(user.email));
            }
            return Err(e.into());
        }
        store::insert_wallet(&mut tx, &wallet).await?;
        tx.commit().await?;

        info!(user_id = %user.id, wallet_id = %wallet.id, "user registered");
        Ok((user, wallet))
    }

    /// Active user by ID
    pub async fn user(&self, id: Uuid) -> Result<User> {
        let mut conn = self.store.pool().acquire().await?;
        store::fetch_active_user(&mut conn, id)
            .await?
            .ok_or(Error::UserNotFound(id))
    }

    /// Active user by email
    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut conn = self.store.pool().acquire().await?;
        store::fetch_active_user_by_email(&mut conn, &email.trim().to_lowercase()).await
    }

    /// Soft-delete a user. The row and its history stay in place.
    pub async fn soft_delete_user(&self, id: Uuid) -> Result<()> {
        let mut conn = self.store.pool().acquire().await?;
        if !store::soft_delete_user(&mut conn, id, Utc::now()).await? {
            return Err(Error::UserNotFound(id));
        }

        info!(user_id = %id, "user soft-deleted");
        Ok(())
    }

    /// Wallet by ID
    pub async fn wallet(&self, id: Uuid) -> Result<Wallet> {
        let mut conn = self.store.pool().acquire().await?;
        store::fetch_wallet(&mut conn, id)
            .await?
            .ok_or_else(|| Error::WalletNotFound(id.to_string()))
    }

    /// Wallet owned by a user
    pub async fn wallet_for_user(&self, user_id: Uuid) -> Result<Wallet> {
        let mut conn = self.store.pool().acquire().await?;
        store::fetch_wallet_by_user(&mut conn, user_id)
            .await?
            .ok_or_else(|| Error::WalletNotFound(format!("user {user_id}")))
    }

    /// Add `amount` to a wallet (read, conditional write, retry on conflict)
    pub async fn credit(&self, wallet_id: Uuid, amount: Decimal) -> Result<Wallet> {
        ensure_positive(amount)?;

        retry_on_conflict(&self.retry, Some(&self.metrics), "credit", move || async move {
            let mut conn = self.store.pool().acquire().await?;
            let wallet = store::fetch_wallet(&mut conn, wallet_id)
                .await?
                .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;

            let balance = wallet
                .balance
                .checked_add(amount)
                .ok_or_else(|| Error::Validation("balance overflow".to_string()))?;
            store::update_wallet_balance(&mut conn, &wallet, balance, Utc::now()).await
        })
        .await
    }

    /// Subtract `amount` from a wallet, rejecting with
    /// [`Error::InsufficientFunds`] when the balance read does not cover it
    pub async fn debit(&self, wallet_id: Uuid, amount: Decimal) -> Result<Wallet> {
        ensure_positive(amount)?;

        retry_on_conflict(&self.retry, Some(&self.metrics), "debit", move || async move {
            let mut conn = self.store.pool().acquire().await?;
            let wallet = store::fetch_wallet(&mut conn, wallet_id)
                .await?
                .ok_or_else(|| Error::WalletNotFound(wallet_id.to_string()))?;

            if wallet.balance < amount {
                return Err(Error::InsufficientFunds {
                    required: amount,
                    available: wallet.balance,
                });
            }

            let balance = wallet
                .balance
                .checked_sub(amount)
                .ok_or_else(|| Error::Validation("balance overflow".to_string()))?;
            store::update_wallet_balance(&mut conn, &wallet, balance, Utc::now()).await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Record a wallet-affecting request as a `pending` transaction.
    ///
    /// The insert is keyed on `(user, idempotency key)`: when the key was
    /// already used the existing row is returned as
    /// [`Submission::Duplicate`] and nothing new is written.
    pub async fn submit(&self, request: NewTransaction) -> Result<Submission> {
        validate_request(&request)?;

        let request = &request;
        let submission = retry_on_conflict(&self.retry, Some(&self.metrics), "submit", move || {
            self.submit_once(request)
        })
        .await?;

        self.metrics.record_submission(submission.is_duplicate());
        match &submission {
            Submission::Created(tx) => info!(
                transaction_id = %tx.id,
                user_id = %tx.user_id,
                kind = %tx.kind,
                amount = %tx.amount,
                "transaction submitted"
            ),
            Submission::Duplicate(tx) => info!(
                transaction_id = %tx.id,
                user_id = %tx.user_id,
                status = %tx.status,
                "duplicate request, returning existing transaction"
            ),
        }

        Ok(submission)
    }

    async fn submit_once(&self, request: &NewTransaction) -> Result<Submission> {
        let mut conn = self.store.pool().acquire().await?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) =
                store::fetch_transaction_by_key(&mut conn, request.user_id, key).await?
            {
                warn_on_mismatch(&existing, request);
                return Ok(Submission::Duplicate(existing));
            }
        }

        store::fetch_active_user(&mut conn, request.user_id)
            .await?
            .ok_or(Error::UserNotFound(request.user_id))?;
        if let Some(to_id) = request.to_id {
            store::fetch_active_user(&mut conn, to_id)
                .await?
                .ok_or(Error::UserNotFound(to_id))?;
        }

        let transaction = build_pending(request, Utc::now());

        match store::insert_transaction(&mut conn, &transaction).await {
            Ok(()) => Ok(Submission::Created(transaction)),
            Err(e) if is_unique_violation(&e) => {
                // Lost the insert race to a concurrent request with the same key
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let existing = store::fetch_transaction_by_key(&mut conn, request.user_id, key)
                    .await?
                    .ok_or_else(|| Error::Database(e))?;
                warn_on_mismatch(&existing, request);
                Ok(Submission::Duplicate(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Transaction by ID
    pub async fn transaction(&self, id: Uuid) -> Result<Transaction> {
        let mut conn = self.store.pool().acquire().await?;
        store::fetch_transaction(&mut conn, id)
            .await?
            .ok_or(Error::TransactionNotFound(id))
    }

    /// All transactions owned by a user, oldest first
    pub async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let mut conn = self.store.pool().acquire().await?;
        store::list_transactions(&mut conn, user_id).await
    }

    /// Apply a pending transaction's effect.
    ///
    /// Safe to call any number of times for the same ID: only a `pending`
    /// transaction is mutated, and the status check, the balance writes and
    /// the status transition commit together. A repeated call returns
    /// [`ApplyOutcome::AlreadyFinal`] without touching any balance.
    pub async fn apply(&self, id: Uuid) -> Result<ApplyOutcome> {
        let started = Instant::now();

        let outcome = retry_on_conflict(&self.retry, Some(&self.metrics), "apply", move || {
            self.apply_once(id)
        })
        .await?;

        let label = match &outcome {
            ApplyOutcome::Completed(_) => "completed",
            ApplyOutcome::Failed { .. } => "failed",
            ApplyOutcome::Expired(_) => "expired",
            ApplyOutcome::AlreadyFinal(_) => "noop",
        };
        self.metrics
            .record_apply(label, started.elapsed().as_secs_f64());

        match &outcome {
            ApplyOutcome::Completed(tx) => info!(
                transaction_id = %tx.id,
                kind = %tx.kind,
                amount = %tx.amount,
                "transaction completed"
            ),
            ApplyOutcome::Failed { transaction, rejection } => info!(
                transaction_id = %transaction.id,
                kind = %transaction.kind,
                reason = %rejection,
                "transaction failed"
            ),
            ApplyOutcome::Expired(tx) => info!(transaction_id = %tx.id, "transaction expired"),
            ApplyOutcome::AlreadyFinal(tx) => info!(
                transaction_id = %tx.id,
                status = %tx.status,
                "transaction already final, nothing to apply"
            ),
        }

        Ok(outcome)
    }

    async fn apply_once(&self, id: Uuid) -> Result<ApplyOutcome> {
        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;

        let record = store::fetch_transaction(&mut tx, id)
            .await?
            .ok_or(Error::TransactionNotFound(id))?;

        if record.status.is_terminal() {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyFinal(record));
        }

        if record.is_overdue(now) {
            let expired = store::transition_transaction(
                &mut tx,
                &record,
                TransactionStatus::Expired,
                Some("expired before completion".to_string()),
                now,
            )
            .await?;
            tx.commit().await?;
            return Ok(ApplyOutcome::Expired(expired));
        }

        let effect = match record.kind {
            TransactionType::TransferOut => apply_transfer(&mut tx, &record, now).await?,
            TransactionType::Topup => {
                adjust_user_balance(&mut tx, record.user_id, record.amount, now).await?
            }
            TransactionType::Payment => {
                adjust_user_balance(&mut tx, record.user_id, -record.amount, now).await?
            }
            TransactionType::TransferIn => {
                return Err(Error::Validation(format!(
                    "transaction {} is a transfer_in record and is applied with its transfer",
                    record.id
                )));
            }
        };

        let outcome = match effect {
            Ok(()) => {
                let completed = store::transition_transaction(
                    &mut tx,
                    &record,
                    TransactionStatus::Completed,
                    None,
                    now,
                )
                .await?;
                ApplyOutcome::Completed(completed)
            }
            Err(rejection) => {
                let failed = store::transition_transaction(
                    &mut tx,
                    &record,
                    TransactionStatus::Failed,
                    Some(rejection.to_string()),
                    now,
                )
                .await?;
                ApplyOutcome::Failed {
                    transaction: failed,
                    rejection,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Expire every pending transaction whose expiry is at or before `now`.
    /// Returns the IDs that this call moved to `expired`.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let candidates = {
            let mut conn = self.store.pool().acquire().await?;
            store::overdue_transaction_ids(&mut conn, now).await?
        };

        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            let moved = retry_on_conflict(&self.retry, Some(&self.metrics), "expire", move || {
                self.expire_once(id, now)
            })
            .await?;

            if moved {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "expired overdue transactions");
        }
        Ok(expired)
    }

    async fn expire_once(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.store.pool().begin().await?;
        let Some(record) = store::fetch_transaction(&mut tx, id).await? else {
            return Ok(false);
        };

        if record.status.is_terminal() || !record.is_overdue(now) {
            debug!(transaction_id = %id, status = %record.status, "skipping expiry");
            return Ok(false);
        }

        store::transition_transaction(
            &mut tx,
            &record,
            TransactionStatus::Expired,
            Some("expired before completion".to_string()),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Record that the outcome event of a terminal transaction was
    /// published. Returns false if it was already recorded.
    pub async fn mark_event_published(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.store.pool().acquire().await?;
        store::mark_event_published(&mut conn, id, Utc::now()).await
    }

    /// Terminal transfers, settled at or before `settled_before`, whose
    /// outcome event has not been recorded as published. Oldest first.
    pub async fn unpublished_transfer_outcomes(
        &self,
        settled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let mut conn = self.store.pool().acquire().await?;
        store::unpublished_transfer_outcomes(&mut conn, settled_before, limit as i64).await
    }
}

/// Debit the sender and credit the recipient of a transfer, and write the
/// recipient's `transfer_in` record. Runs inside the caller's transaction.
async fn apply_transfer(
    conn: &mut SqliteConnection,
    record: &Transaction,
    now: DateTime<Utc>,
) -> Result<Effect> {
    let (from_id, to_id) = match (record.from_id, record.to_id) {
        (Some(from), Some(to)) if from != to => (from, to),
        (Some(_), Some(_)) => {
            return Ok(Err(Rejection::InvalidCounterparty(
                "sender and recipient are the same user".to_string(),
            )))
        }
        _ => {
            return Ok(Err(Rejection::InvalidCounterparty(
                "transfer is missing a party".to_string(),
            )))
        }
    };

    for party in [from_id, to_id] {
        if store::fetch_active_user(conn, party).await?.is_none() {
            return Ok(Err(Rejection::InvalidCounterparty(format!(
                "user {party} is deleted or unknown"
            ))));
        }
    }

    let Some(source) = store::fetch_wallet_by_user(conn, from_id).await? else {
        return Ok(Err(Rejection::WalletNotFound(from_id)));
    };
    let Some(destination) = store::fetch_wallet_by_user(conn, to_id).await? else {
        return Ok(Err(Rejection::WalletNotFound(to_id)));
    };

    if source.balance < record.amount {
        return Ok(Err(Rejection::InsufficientFunds {
            required: record.amount,
            available: source.balance,
        }));
    }

    let Some(credited) = destination.balance.checked_add(record.amount) else {
        return Ok(Err(Rejection::BalanceOverflow(to_id)));
    };

    store::update_wallet_balance(conn, &source, source.balance - record.amount, now).await?;
    store::update_wallet_balance(conn, &destination, credited, now).await?;

    let incoming = Transaction {
        id: Uuid::new_v4(),
        user_id: to_id,
        kind: TransactionType::TransferIn,
        amount: record.amount,
        status: TransactionStatus::Completed,
        from_id: Some(from_id),
        to_id: Some(to_id),
        from_label: record.from_label.clone(),
        to_label: record.to_label.clone(),
        merchant_id: None,
        description: record.description.clone(),
        // One incoming record per transfer, enforced by the unique index
        idempotency_key: Some(format!("{TRANSFER_IN_KEY_PREFIX}{}", record.id)),
        failure_reason: None,
        expires_at: None,
        event_published_at: None,
        created_at: now,
        updated_at: now,
        completed_at: Some(now),
    };
    store::insert_transaction(conn, &incoming).await.map_err(|e| {
        if is_unique_violation(&e) {
            Error::Conflict(format!("transfer {} already credited", record.id))
        } else {
            e.into()
        }
    })?;

    Ok(Ok(()))
}

/// Apply a signed delta to a user's wallet inside the caller's transaction
async fn adjust_user_balance(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    delta: Decimal,
    now: DateTime<Utc>,
) -> Result<Effect> {
    let Some(wallet) = store::fetch_wallet_by_user(conn, user_id).await? else {
        return Ok(Err(Rejection::WalletNotFound(user_id)));
    };

    let Some(new_balance) = wallet.balance.checked_add(delta) else {
        return Ok(Err(Rejection::BalanceOverflow(user_id)));
    };
    if new_balance < Decimal::ZERO {
        return Ok(Err(Rejection::InsufficientFunds {
            required: -delta,
            available: wallet.balance,
        }));
    }

    store::update_wallet_balance(conn, &wallet, new_balance, now).await?;
    Ok(Ok(()))
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::Validation(format!("amount must be positive, got {amount}")));
    }
    Ok(())
}

fn validate_request(request: &NewTransaction) -> Result<()> {
    ensure_positive(request.amount)?;

    if let Some(key) = &request.idempotency_key {
        if key.trim().is_empty() {
            return Err(Error::Validation("idempotency key must not be blank".to_string()));
        }
        if key.starts_with(TRANSFER_IN_KEY_PREFIX) {
            return Err(Error::Validation(format!(
                "idempotency keys starting with {TRANSFER_IN_KEY_PREFIX:?} are reserved"
            )));
        }
    }

    match request.kind {
        TransactionType::TransferOut => match request.to_id {
            None => Err(Error::Validation("transfer requires a recipient".to_string())),
            Some(to) if to == request.user_id => {
                Err(Error::Validation("cannot transfer to yourself".to_string()))
            }
            Some(_) => Ok(()),
        },
        TransactionType::Payment => match request.merchant_id.as_deref() {
            Some(merchant) if !merchant.trim().is_empty() => Ok(()),
            _ => Err(Error::Validation("payment requires a merchant".to_string())),
        },
        TransactionType::Topup => Ok(()),
        TransactionType::TransferIn => Err(Error::Validation(
            "transfer_in records are written by the ledger".to_string(),
        )),
    }
}

fn build_pending(request: &NewTransaction, now: DateTime<Utc>) -> Transaction {
    let owner = request.user_id.to_string();

    let (from_id, to_id, from_label, to_label) = match request.kind {
        TransactionType::TransferOut | TransactionType::TransferIn => {
            let to = request.to_id.map(|id| id.to_string()).unwrap_or_default();
            (Some(request.user_id), request.to_id, owner, to)
        }
        TransactionType::Topup => (None, None, SYSTEM_LABEL.to_string(), owner),
        TransactionType::Payment => {
            let merchant = request.merchant_id.clone().unwrap_or_default();
            (None, None, owner, merchant)
        }
    };

    Transaction {
        id: Uuid::new_v4(),
        user_id: request.user_id,
        kind: request.kind,
        amount: request.amount,
        status: TransactionStatus::Pending,
        from_id,
        to_id,
        from_label,
        to_label,
        merchant_id: request.merchant_id.clone(),
        description: request.description.clone(),
        idempotency_key: request.idempotency_key.clone(),
        failure_reason: None,
        expires_at: request.expires_at,
        event_published_at: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

fn warn_on_mismatch(existing: &Transaction, request: &NewTransaction) {
    if existing.amount != request.amount || existing.kind != request.kind {
        warn!(
            transaction_id = %existing.id,
            stored_amount = %existing.amount,
            requested_amount = %request.amount,
            "idempotency key reused with different request parameters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_non_positive_amounts() {
        let user = Uuid::new_v4();
        assert!(validate_request(&NewTransaction::topup(user, Decimal::ZERO)).is_err());
        assert!(validate_request(&NewTransaction::topup(user, Decimal::from(-5))).is_err());
        assert!(validate_request(&NewTransaction::topup(user, Decimal::new(1, 2))).is_ok());
    }

    #[test]
    fn test_validate_transfer_parties() {
        let user = Uuid::new_v4();
        let amount = Decimal::from(10);
        assert!(validate_request(&NewTransaction::transfer(user, user, amount)).is_err());
        assert!(validate_request(&NewTransaction::transfer(user, Uuid::new_v4(), amount)).is_ok());

        let mut missing = NewTransaction::transfer(user, Uuid::new_v4(), amount);
        missing.to_id = None;
        assert!(validate_request(&missing).is_err());
    }

    #[test]
    fn test_validate_blank_key_and_merchant() {
        let user = Uuid::new_v4();
        let amount = Decimal::from(10);
        assert!(validate_request(&NewTransaction::topup(user, amount).with_idempotency_key("  ")).is_err());
        assert!(validate_request(&NewTransaction::payment(user, "", amount)).is_err());
        assert!(validate_request(&NewTransaction::payment(user, "m-1", amount)).is_ok());
    }

    #[test]
    fn test_build_pending_labels() {
        let user = Uuid::new_v4();
        let topup = build_pending(&NewTransaction::topup(user, Decimal::ONE), Utc::now());
        assert_eq!(topup.from_label, "system");
        assert_eq!(topup.to_label, user.to_string());
        assert_eq!(topup.status, TransactionStatus::Pending);

        let to = Uuid::new_v4();
        let transfer = build_pending(&NewTransaction::transfer(user, to, Decimal::ONE), Utc::now());
        assert_eq!(transfer.from_id, Some(user));
        assert_eq!(transfer.to_id, Some(to));

        let payment = build_pending(&NewTransaction::payment(user, "shop-7", Decimal::ONE), Utc::now());
        assert_eq!(payment.to_label, "shop-7");
        assert_eq!(payment.merchant_id.as_deref(), Some("shop-7"));
    }
}
