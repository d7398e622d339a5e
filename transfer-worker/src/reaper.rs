//! Expiry reaper and outcome sweep
//!
//! Periodically moves overdue `pending` transactions to `expired` and makes
//! sure every settled transfer eventually has its outcome event on the bus,
//! including those whose first publish failed after the effect committed.

use chrono::{DateTime, Utc};
use event_bus::{Error as BusError, EventSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wallet_ledger::Ledger;

use crate::outcome::publish_outcome;
use crate::{Result, WorkerError};

/// Outcomes swept per pass
const SWEEP_BATCH: usize = 100;

/// Counts from one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Transactions moved to `expired`
    pub expired: usize,
    /// Outcome events published
    pub published: usize,
}

/// Periodic expiry and outbox sweep
pub struct Reaper<S: ?Sized> {
    ledger: Ledger,
    events: Arc<S>,
    outbox_grace: Duration,
}

impl<S: ?Sized> std::fmt::Debug for Reaper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("outbox_grace", &self.outbox_grace)
            .finish()
    }
}

impl<S> Reaper<S>
where
    S: EventSink + ?Sized,
{
    /// Reaper sweeping outcomes older than `outbox_grace`, leaving younger
    /// ones to the handler that settled them
    pub fn new(ledger: Ledger, events: Arc<S>, outbox_grace: Duration) -> Self {
        Self {
            ledger,
            events,
            outbox_grace,
        }
    }

    /// One pass at `now`
    pub async fn reap_once(&self, cancel: &CancellationToken, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        for id in self.ledger.expire_overdue(now).await? {
            report.expired += 1;
            let tx = self.ledger.transaction(id).await?;
            if self.publish(cancel, &tx).await? {
                report.published += 1;
            }
        }

        let grace = chrono::Duration::from_std(self.outbox_grace)
            .map_err(|e| WorkerError::Config(format!("outbox grace out of range: {e}")))?;
        let stale = self
            .ledger
            .unpublished_transfer_outcomes(now - grace, SWEEP_BATCH)
            .await?;
        for tx in &stale {
            if self.publish(cancel, tx).await? {
                report.published += 1;
            }
        }

        if report != ReapReport::default() {
            info!(expired = report.expired, published = report.published, "Reaper pass");
        } else {
            debug!("Reaper pass, nothing to do");
        }
        Ok(report)
    }

    /// Publish one outcome. A failed publish is left for the next pass;
    /// cancellation ends the pass.
    async fn publish(&self, cancel: &CancellationToken, tx: &wallet_ledger::Transaction) -> Result<bool> {
        match publish_outcome(&self.ledger, self.events.as_ref(), cancel, tx).await {
            Ok(published) => Ok(published),
            Err(WorkerError::Bus(BusError::Cancelled)) => Err(WorkerError::Bus(BusError::Cancelled)),
            Err(WorkerError::Bus(e)) => {
                warn!(transaction_id = %tx.id, error = %e, "Outcome publish failed, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run passes every `period` until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period_ms = period.as_millis() as u64, "Reaper started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reap_once(&cancel, Utc::now()).await {
                        Ok(_) => {}
                        Err(WorkerError::Bus(BusError::Cancelled)) => break,
                        Err(e) => error!(error = %e, "Reaper pass failed"),
                    }
                }
            }
        }
        info!("Reaper stopped");
    }
}
