//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_submissions_total{result}` - Submitted transactions (created/duplicate)
//! - `ledger_apply_total{outcome}` - Applied effects by outcome
//! - `ledger_write_conflicts_total` - Lost conditional writes (retried)
//! - `ledger_retries_exhausted_total` - Retry budgets spent without success
//! - `ledger_apply_duration_seconds` - Histogram of apply latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Submissions by result
    pub submissions_total: IntCounterVec,

    /// Applied effects by outcome
    pub apply_total: IntCounterVec,

    /// Lost conditional writes
    pub write_conflicts_total: IntCounter,

    /// Exhausted retry budgets
    pub retries_exhausted_total: IntCounter,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let submissions_total = IntCounterVec::new(
            Opts::new("ledger_submissions_total", "Submitted transactions by result"),
            &["result"],
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        let apply_total = IntCounterVec::new(
            Opts::new("ledger_apply_total", "Applied transaction effects by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(apply_total.clone()))?;

        let write_conflicts_total = IntCounter::new(
            "ledger_write_conflicts_total",
            "Conditional writes lost to a concurrent mutation",
        )?;
        registry.register(Box::new(write_conflicts_total.clone()))?;

        let retries_exhausted_total = IntCounter::new(
            "ledger_retries_exhausted_total",
            "Optimistic retry budgets spent without success",
        )?;
        registry.register(Box::new(retries_exhausted_total.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new("ledger_apply_duration_seconds", "Histogram of apply latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        Ok(Self {
            submissions_total,
            apply_total,
            write_conflicts_total,
            retries_exhausted_total,
            apply_duration,
            registry,
        })
    }

    /// Record a submission
    pub fn record_submission(&self, duplicate: bool) {
        let result = if duplicate { "duplicate" } else { "created" };
        self.submissions_total.with_label_values(&[result]).inc();
    }

    /// Record an apply outcome
    pub fn record_apply(&self, outcome: &str, duration_seconds: f64) {
        self.apply_total.with_label_values(&[outcome]).inc();
        self.apply_duration.observe(duration_seconds);
    }

    /// Record a lost conditional write
    pub fn record_conflict(&self) {
        self.write_conflicts_total.inc();
    }

    /// Record an exhausted retry budget
    pub fn record_exhausted(&self) {
        self.retries_exhausted_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
