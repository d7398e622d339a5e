//! Bounded retry for optimistic writes
//!
//! Every balance mutation is a read → compute → conditional write sequence.
//! When the conditional write loses (version moved, or SQLite reports lock
//! contention) the whole sequence is re-run from the read. There is no
//! global lock: unrelated wallets never wait on each other.

use crate::{config::RetryConfig, metrics::Metrics, Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for the read-check-write loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Create policy
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Attempts before giving up
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry `attempt` (1-based), exponential with jitter
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        // Up to 50% jitter so racing writers spread out
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
        } else {
            Duration::ZERO
        };

        base + jitter
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Run `operation` until it stops reporting [`Error::Conflict`].
///
/// Any other result, success or error, is returned as is. After
/// `max_attempts` conflicts the call fails with
/// [`Error::ConcurrencyExhausted`].
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    metrics: Option<&Metrics>,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Err(Error::Conflict(reason)) => {
                if let Some(metrics) = metrics {
                    metrics.record_conflict();
                }

                if attempt == policy.max_attempts {
                    break;
                }

                let delay = policy.delay_for(attempt);
                debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    %reason,
                    "write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }

    if let Some(metrics) = metrics {
        metrics.record_exhausted();
    }
    warn!(
        operation = operation_name,
        attempts = policy.max_attempts,
        "optimistic retry budget exhausted"
    );

    Err(Error::ConcurrencyExhausted {
        attempts: policy.max_attempts,
    })
}
