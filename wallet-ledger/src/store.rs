//! SQLite storage layer
//!
//! Row-level queries take a `&mut SqliteConnection` so the same statement
//! can run on a pooled connection or inside an open transaction. Schema
//! invariants (CHECKs, foreign keys, unique indexes) live in the embedded
//! migrations and are enforced by SQLite itself.

use crate::{
    types::{format_timestamp, AccessToken, Transaction, TransactionStatus, User, Wallet},
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

/// Connection pool with the ledger schema applied
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database, enable foreign keys and run migrations
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        // In-memory databases vanish with their last connection, so the
        // pool keeps one open for its whole lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(
            database_url = %config.database_url,
            max_connections = config.max_connections,
            "ledger store ready"
        );

        Ok(Self { pool })
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub(crate) async fn insert_user(
    conn: &mut SqliteConnection,
    user: &User,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO users (id, name, email, password, created_at, updated_at, deleted_at)
        VALUES (?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(user.id.to_string())
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(format_timestamp(user.created_at))
    .bind(format_timestamp(user.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

/// Active (not soft-deleted) user by ID
pub(crate) async fn fetch_active_user(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE id = ? AND deleted_at IS NULL")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(User::from_row).transpose()
}

/// Active user by email
pub(crate) async fn fetch_active_user_by_email(
    conn: &mut SqliteConnection,
    email: &str,
) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE email = ? AND deleted_at IS NULL")
        .bind(email)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(User::from_row).transpose()
}

/// Stamp `deleted_at`; false when the user is missing or already deleted
pub(crate) async fn soft_delete_user(
    conn: &mut SqliteConnection,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE users SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(format_timestamp(now))
    .bind(format_timestamp(now))
    .bind(id.to_string())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Wallets
// ---------------------------------------------------------------------------

pub(crate) async fn insert_wallet(conn: &mut SqliteConnection, wallet: &Wallet) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wallets (id, user_id, balance, version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(wallet.id.to_string())
    .bind(wallet.user_id.to_string())
    .bind(wallet.balance.to_string())
    .bind(wallet.version)
    .bind(format_timestamp(wallet.created_at))
    .bind(format_timestamp(wallet.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn fetch_wallet(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Wallet>> {
    let row = sqlx::query("SELECT * FROM wallets WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(Wallet::from_row).transpose()
}

pub(crate) async fn fetch_wallet_by_user(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> Result<Option<Wallet>> {
    let row = sqlx::query("SELECT * FROM wallets WHERE user_id = ?")
        .bind(user_id.to_string())
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(Wallet::from_row).transpose()
}

/// Conditional write: commits `new_balance` only if the stored version is
/// still the one in `read`. Zero rows affected means a concurrent
/// mutation committed first and is reported as [`Error::Conflict`].
pub(crate) async fn update_wallet_balance(
    conn: &mut SqliteConnection,
    read: &Wallet,
    new_balance: Decimal,
    now: DateTime<Utc>,
) -> Result<Wallet> {
    if new_balance < Decimal::ZERO {
        return Err(Error::InsufficientFunds {
            required: read.balance - new_balance,
            available: read.balance,
        });
    }

    let result = sqlx::query(
        r#"
        UPDATE wallets
        SET balance = ?, version = version + 1, updated_at = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(new_balance.to_string())
    .bind(format_timestamp(now))
    .bind(read.id.to_string())
    .bind(read.version)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "wallet {} moved past version {}",
            read.id, read.version
        )));
    }

    Ok(Wallet {
        balance: new_balance,
        version: read.version + 1,
        updated_at: now,
        ..read.clone()
    })
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Insert a transaction row. Returns the raw driver error so callers can
/// tell a unique-key collision apart from other failures.
pub(crate) async fn insert_transaction(
    conn: &mut SqliteConnection,
    tx: &Transaction,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, user_id, type, amount, status,
            from_id, to_id, from_label, to_label,
            merchant_id, description, idempotency_key, failure_reason,
            expires_at, event_published_at, created_at, updated_at, completed_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tx.id.to_string())
    .bind(tx.user_id.to_string())
    .bind(tx.kind.as_str())
    .bind(tx.amount.to_string())
    .bind(tx.status.as_str())
    .bind(tx.from_id.map(|id| id.to_string()))
    .bind(tx.to_id.map(|id| id.to_string()))
    .bind(&tx.from_label)
    .bind(&tx.to_label)
    .bind(&tx.merchant_id)
    .bind(&tx.description)
    .bind(&tx.idempotency_key)
    .bind(&tx.failure_reason)
    .bind(tx.expires_at.map(format_timestamp))
    .bind(tx.event_published_at.map(format_timestamp))
    .bind(format_timestamp(tx.created_at))
    .bind(format_timestamp(tx.updated_at))
    .bind(tx.completed_at.map(format_timestamp))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn fetch_transaction(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<Transaction>> {
    let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(Transaction::from_row).transpose()
}

pub(crate) async fn fetch_transaction_by_key(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    idempotency_key: &str,
) -> Result<Option<Transaction>> {
    let row = sqlx::query("SELECT * FROM transactions WHERE user_id = ? AND idempotency_key = ?")
        .bind(user_id.to_string())
        .bind(idempotency_key)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(Transaction::from_row).transpose()
}

pub(crate) async fn list_transactions(
    conn: &mut SqliteConnection,
    user_id: Uuid,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query("SELECT * FROM transactions WHERE user_id = ? ORDER BY created_at, id")
        .bind(user_id.to_string())
        .fetch_all(conn)
        .await?;

    rows.iter().map(Transaction::from_row).collect()
}

/// Move a pending transaction to a terminal status. The update is guarded
/// on `status = 'pending'`; losing that race is a [`Error::Conflict`] so
/// the caller re-reads and sees the winner's terminal state.
pub(crate) async fn transition_transaction(
    conn: &mut SqliteConnection,
    read: &Transaction,
    next: TransactionStatus,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Transaction> {
    if !read.status.can_transition_to(next) {
        return Err(Error::Conflict(format!(
            "transaction {} cannot move {} -> {}",
            read.id, read.status, next
        )));
    }

    let completed_at = (next == TransactionStatus::Completed).then_some(now);

    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = ?, failure_reason = ?, completed_at = ?, updated_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(next.as_str())
    .bind(&reason)
    .bind(completed_at.map(format_timestamp))
    .bind(format_timestamp(now))
    .bind(read.id.to_string())
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "transaction {} is no longer pending",
            read.id
        )));
    }

    Ok(Transaction {
        status: next,
        failure_reason: reason,
        completed_at,
        updated_at: now,
        ..read.clone()
    })
}

/// IDs of pending transactions whose expiry is at or before `now`
pub(crate) async fn overdue_transaction_ids(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM transactions
        WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
        ORDER BY expires_at
        "#,
    )
    .bind(format_timestamp(now))
    .fetch_all(conn)
    .await?;

    ids.iter()
        .map(|id| Uuid::parse_str(id).map_err(|e| Error::Corrupt(format!("bad uuid {id:?}: {e}"))))
        .collect()
}

/// Terminal transfers settled at or before `settled_before` whose outcome
/// event was never recorded as published
pub(crate) async fn unpublished_transfer_outcomes(
    conn: &mut SqliteConnection,
    settled_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM transactions
        WHERE type = 'transfer_out'
          AND status != 'pending'
          AND event_published_at IS NULL
          AND updated_at <= ?
        ORDER BY updated_at
        LIMIT ?
        "#,
    )
    .bind(format_timestamp(settled_before))
    .bind(limit)
    .fetch_all(conn)
    .await?;

    rows.iter().map(Transaction::from_row).collect()
}

/// Record that the outcome event of a terminal transaction reached the
/// bus. False if it was already recorded or the transaction is pending.
pub(crate) async fn mark_event_published(
    conn: &mut SqliteConnection,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET event_published_at = ?
        WHERE id = ? AND status != 'pending' AND event_published_at IS NULL
        "#,
    )
    .bind(format_timestamp(now))
    .bind(id.to_string())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Access tokens
// ---------------------------------------------------------------------------

pub(crate) async fn insert_access_token(
    conn: &mut SqliteConnection,
    token: &AccessToken,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO access_tokens (id, user_id, token_hash, expires_at, issued_at, revoked_at)
        VALUES (?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(token.id.to_string())
    .bind(token.user_id.to_string())
    .bind(&token.token_hash)
    .bind(format_timestamp(token.expires_at))
    .bind(format_timestamp(token.issued_at))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn fetch_access_token(
    conn: &mut SqliteConnection,
    token_hash: &str,
) -> Result<Option<AccessToken>> {
    let row = sqlx::query("SELECT * FROM access_tokens WHERE token_hash = ?")
        .bind(token_hash)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(AccessToken::from_row).transpose()
}

pub(crate) async fn revoke_access_token(
    conn: &mut SqliteConnection,
    token_hash: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE access_tokens SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
    )
    .bind(format_timestamp(now))
    .bind(token_hash)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn revoke_user_access_tokens(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE access_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
    )
    .bind(format_timestamp(now))
    .bind(user_id.to_string())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
