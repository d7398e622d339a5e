//! Access token revocation records
//!
//! Issued credentials are stored only as SHA-256 hex digests. A token is
//! accepted while it is neither revoked nor past its expiry.

use crate::{error::is_unique_violation, store, types::AccessToken, Error, Ledger, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

/// SHA-256 hex digest of a raw credential
pub fn token_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

impl Ledger {
    /// Record an issued credential for `user_id`
    pub async fn record_token(
        &self,
        user_id: Uuid,
        raw: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let now = Utc::now();
        if expires_at <= now {
            return Err(Error::Validation("token already expired".to_string()));
        }

        let token = AccessToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: token_digest(raw),
            expires_at,
            issued_at: now,
            revoked_at: None,
        };

        let mut conn = self.store().pool().acquire().await?;
        store::fetch_active_user(&mut conn, user_id)
            .await?
            .ok_or(Error::UserNotFound(user_id))?;

        store::insert_access_token(&mut conn, &token)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Validation("token already recorded".to_string())
                } else {
                    e.into()
                }
            })?;

        Ok(token)
    }

    /// Stored record for a raw credential
    pub async fn find_token(&self, raw: &str) -> Result<Option<AccessToken>> {
        let mut conn = self.store().pool().acquire().await?;
        store::fetch_access_token(&mut conn, &token_digest(raw)).await
    }

    /// Revoke one credential. False if unknown or already revoked.
    pub async fn revoke_token(&self, raw: &str) -> Result<bool> {
        let mut conn = self.store().pool().acquire().await?;
        store::revoke_access_token(&mut conn, &token_digest(raw), Utc::now()).await
    }

    /// Revoke every outstanding credential of a user (logout everywhere)
    pub async fn revoke_all_tokens(&self, user_id: Uuid) -> Result<u64> {
        let mut conn = self.store().pool().acquire().await?;
        let revoked = store::revoke_user_access_tokens(&mut conn, user_id, Utc::now()).await?;

        info!(user_id = %user_id, revoked, "revoked access tokens");
        Ok(revoked)
    }

    /// Whether a raw credential is recorded, unrevoked and unexpired at `now`
    pub async fn is_token_active(&self, raw: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .find_token(raw)
            .await?
            .map(|token| token.is_active(now))
            .unwrap_or(false))
    }
}
