//! Core types for the wallet ledger
//!
//! All money is carried as `Decimal` (exact arithmetic). Rows are decoded
//! from SQLite by hand so that decimals and timestamps keep a canonical,
//! lexically ordered text form in storage.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Registered user. Soft-deleted users keep their row for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Unique email
    pub email: String,
    /// Credential hash, produced outside the ledger
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion timestamp
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Whether the user has been soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password")?,
            created_at: parse_timestamp(row.try_get("created_at")?)?,
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
            deleted_at: parse_optional_timestamp(row.try_get("deleted_at")?)?,
        })
    }
}

/// Fields needed to register a user
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Display name
    pub name: String,
    /// Email, unique across all users
    pub email: String,
    /// Already-hashed credential
    pub password_hash: String,
}

/// One balance per user, guarded by an optimistic version counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: Uuid,
    /// Owning user (unique)
    pub user_id: Uuid,
    /// Balance, never negative
    pub balance: Decimal,
    /// Incremented on every balance mutation
    pub version: i64,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            user_id: parse_uuid(row.try_get("user_id")?)?,
            balance: parse_decimal(row.try_get("balance")?)?,
            version: row.try_get("version")?,
            created_at: parse_timestamp(row.try_get("created_at")?)?,
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        })
    }
}

/// Kind of monetary movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Funds entering the platform
    Topup,
    /// Sender side of a transfer
    TransferOut,
    /// Recipient side of a transfer
    TransferIn,
    /// Payment to a merchant
    Payment,
}

impl TransactionType {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Topup => "topup",
            TransactionType::TransferOut => "transfer_out",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::Payment => "payment",
        }
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "topup" => Ok(TransactionType::Topup),
            "transfer_out" => Ok(TransactionType::TransferOut),
            "transfer_in" => Ok(TransactionType::TransferIn),
            "payment" => Ok(TransactionType::Payment),
            other => Err(Error::Corrupt(format!("unknown transaction type {other:?}"))),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, effect not yet applied
    Pending,
    /// Effect applied (terminal)
    Completed,
    /// Rejected, no effect (terminal)
    Failed,
    /// Expiry passed before completion (terminal)
    Expired,
}

impl TransactionStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Expired => "expired",
        }
    }

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Transitions only ever leave `Pending`
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        *self == TransactionStatus::Pending && next.is_terminal()
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "expired" => Ok(TransactionStatus::Expired),
            other => Err(Error::Corrupt(format!("unknown transaction status {other:?}"))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single monetary movement. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// Movement kind
    pub kind: TransactionType,
    /// Positive amount
    pub amount: Decimal,
    /// Current status
    pub status: TransactionStatus,
    /// Sending user (transfers)
    pub from_id: Option<Uuid>,
    /// Receiving user (transfers)
    pub to_id: Option<Uuid>,
    /// Human-readable source ("system", user id, ...)
    pub from_label: String,
    /// Human-readable destination (user id, merchant id, ...)
    pub to_label: String,
    /// Merchant (payments)
    pub merchant_id: Option<String>,
    /// Free-text description
    pub description: Option<String>,
    /// Client idempotency key, unique per owning user
    pub idempotency_key: Option<String>,
    /// Why the transaction failed or expired
    pub failure_reason: Option<String>,
    /// Payment request expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// When the outcome event was accepted by the bus
    pub event_published_at: Option<DateTime<Utc>>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Whether the expiry has passed at `now`
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let kind: String = row.try_get("type")?;
        let status: String = row.try_get("status")?;

        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            user_id: parse_uuid(row.try_get("user_id")?)?,
            kind: kind.parse()?,
            amount: parse_decimal(row.try_get("amount")?)?,
            status: status.parse()?,
            from_id: parse_optional_uuid(row.try_get("from_id")?)?,
            to_id: parse_optional_uuid(row.try_get("to_id")?)?,
            from_label: row.try_get("from_label")?,
            to_label: row.try_get("to_label")?,
            merchant_id: row.try_get("merchant_id")?,
            description: row.try_get("description")?,
            idempotency_key: row.try_get("idempotency_key")?,
            failure_reason: row.try_get("failure_reason")?,
            expires_at: parse_optional_timestamp(row.try_get("expires_at")?)?,
            event_published_at: parse_optional_timestamp(row.try_get("event_published_at")?)?,
            created_at: parse_timestamp(row.try_get("created_at")?)?,
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
            completed_at: parse_optional_timestamp(row.try_get("completed_at")?)?,
        })
    }
}

/// Request to record a new movement in `pending` state
#[derive(Debug, Clone)]
pub struct NewTransaction {
    /// Owning user
    pub user_id: Uuid,
    /// Movement kind (`transfer_in` rows are written by the ledger itself)
    pub kind: TransactionType,
    /// Positive amount
    pub amount: Decimal,
    /// Receiving user for transfers
    pub to_id: Option<Uuid>,
    /// Merchant for payments
    pub merchant_id: Option<String>,
    /// Free-text description
    pub description: Option<String>,
    /// Client idempotency key
    pub idempotency_key: Option<String>,
    /// Expiry for payment requests
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewTransaction {
    /// Transfer from `user_id` to `to_id`
    pub fn transfer(user_id: Uuid, to_id: Uuid, amount: Decimal) -> Self {
        Self {
            user_id,
            kind: TransactionType::TransferOut,
            amount,
            to_id: Some(to_id),
            merchant_id: None,
            description: None,
            idempotency_key: None,
            expires_at: None,
        }
    }

    /// Top-up into the user's own wallet
    pub fn topup(user_id: Uuid, amount: Decimal) -> Self {
        Self {
            user_id,
            kind: TransactionType::Topup,
            amount,
            to_id: None,
            merchant_id: None,
            description: None,
            idempotency_key: None,
            expires_at: None,
        }
    }

    /// Payment from the user's wallet to a merchant
    pub fn payment(user_id: Uuid, merchant_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            user_id,
            kind: TransactionType::Payment,
            amount,
            to_id: None,
            merchant_id: Some(merchant_id.into()),
            description: None,
            idempotency_key: None,
            expires_at: None,
        }
    }

    /// Set idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set expiry
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Result of a submit. A duplicate is not an error: it resolves to the
/// transaction stored by the first request carrying the same key.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A new pending row was inserted
    Created(Transaction),
    /// `(user, idempotency key)` already existed
    Duplicate(Transaction),
}

impl Submission {
    /// The stored transaction, new or existing
    pub fn transaction(&self) -> &Transaction {
        match self {
            Submission::Created(tx) | Submission::Duplicate(tx) => tx,
        }
    }

    /// Consume into the stored transaction
    pub fn into_transaction(self) -> Transaction {
        match self {
            Submission::Created(tx) | Submission::Duplicate(tx) => tx,
        }
    }

    /// Whether this request was filtered as a duplicate
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Submission::Duplicate(_))
    }
}

/// Business reason a pending transaction was moved to `failed`
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Debited wallet cannot cover the amount
    InsufficientFunds {
        /// Amount requested
        required: Decimal,
        /// Balance seen by the last attempt
        available: Decimal,
    },
    /// A party has no wallet
    WalletNotFound(Uuid),
    /// Transfer counterparty missing or equal to the sender
    InvalidCounterparty(String),
    /// Credited wallet cannot represent the new balance
    BalanceOverflow(Uuid),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InsufficientFunds { required, available } => {
                write!(f, "insufficient funds: required {required}, available {available}")
            }
            Rejection::WalletNotFound(user_id) => write!(f, "wallet not found for user {user_id}"),
            Rejection::InvalidCounterparty(reason) => write!(f, "invalid counterparty: {reason}"),
            Rejection::BalanceOverflow(user_id) => {
                write!(f, "balance overflow in wallet of user {user_id}")
            }
        }
    }
}

/// Result of applying a transaction's effect
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Effect applied, transaction now `completed`
    Completed(Transaction),
    /// Business rejection recorded, transaction now `failed`
    Failed {
        /// Updated transaction
        transaction: Transaction,
        /// Why
        rejection: Rejection,
    },
    /// Expiry passed, transaction now `expired`
    Expired(Transaction),
    /// Transaction was already terminal; nothing was changed
    AlreadyFinal(Transaction),
}

impl ApplyOutcome {
    /// The transaction after the call
    pub fn transaction(&self) -> &Transaction {
        match self {
            ApplyOutcome::Completed(tx)
            | ApplyOutcome::Expired(tx)
            | ApplyOutcome::AlreadyFinal(tx) => tx,
            ApplyOutcome::Failed { transaction, .. } => transaction,
        }
    }

    /// Whether this call changed any state
    pub fn is_noop(&self) -> bool {
        matches!(self, ApplyOutcome::AlreadyFinal(_))
    }
}

/// Revocation record for an issued credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Token record ID
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// SHA-256 hex of the raw credential
    pub token_hash: String,
    /// Natural expiry
    pub expires_at: DateTime<Utc>,
    /// Issuance time
    pub issued_at: DateTime<Utc>,
    /// Revocation time
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Valid only if neither revoked nor expired at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(row.try_get("id")?)?,
            user_id: parse_uuid(row.try_get("user_id")?)?,
            token_hash: row.try_get("token_hash")?,
            expires_at: parse_timestamp(row.try_get("expires_at")?)?,
            issued_at: parse_timestamp(row.try_get("issued_at")?)?,
            revoked_at: parse_optional_timestamp(row.try_get("revoked_at")?)?,
        })
    }
}

/// Canonical text form for stored timestamps: fixed width, UTC, sortable
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}

fn parse_uuid(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| Error::Corrupt(format!("bad uuid {raw:?}: {e}")))
}

fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(parse_uuid).transpose()
}

fn parse_decimal(raw: String) -> Result<Decimal> {
    Decimal::from_str(&raw).map_err(|e| Error::Corrupt(format!("bad decimal {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_terminal() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Expired.is_terminal());
    }

    #[test]
    fn test_transitions_only_leave_pending() {
        use TransactionStatus::*;

        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Pending));

        for terminal in [Completed, Failed, Expired] {
            for next in [Pending, Completed, Failed, Expired] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_stored_names_round_trip() {
        for kind in [
            TransactionType::Topup,
            TransactionType::TransferOut,
            TransactionType::TransferIn,
            TransactionType::Payment,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionType>().unwrap(), kind);
        }
        assert!("refund".parse::<TransactionType>().is_err());
        assert!("settled".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1);
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert_eq!(format_timestamp(earlier).len(), format_timestamp(later).len());
    }

    #[test]
    fn test_access_token_activity() {
        let now = Utc::now();
        let mut token = AccessToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: "ab".repeat(32),
            expires_at: now + Duration::hours(1),
            issued_at: now,
            revoked_at: None,
        };
        assert!(token.is_active(now));
        assert!(!token.is_active(now + Duration::hours(2)));

        token.revoked_at = Some(now);
        assert!(!token.is_active(now));
    }

    #[test]
    fn test_rejection_reason_text() {
        let rejection = Rejection::InsufficientFunds {
            required: Decimal::from(40),
            available: Decimal::from(20),
        };
        assert_eq!(
            rejection.to_string(),
            "insufficient funds: required 40, available 20"
        );
    }
}
