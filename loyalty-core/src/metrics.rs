//! Metrics collection for observability
//!
//! Prometheus metrics for the ledger and the retry queue, registered on an
//! owned [`Registry`] so several ledgers (and tests) can coexist in one
//! process.
//!
//! # Metrics
//!
//! - `loyalty_commits_total` - Balance commits applied
//! - `loyalty_commits_rejected_total` - Commits refused by validation
//! - `loyalty_commit_duration_seconds` - Histogram of commit latencies
//! - `loyalty_commission_credits_total` - Commission items credited
//! - `loyalty_operations_enqueued_total` - Operations sent to the retry queue
//! - `loyalty_replays_succeeded_total` / `loyalty_replays_failed_total` - Drain outcomes
//! - `loyalty_dead_letters_total` - Operations moved to the dead-letter list
//! - `loyalty_queue_depth` - Pending operations after the last queue change

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Commits applied
    pub commits_total: IntCounter,

    /// Commits refused by validation
    pub commits_rejected: IntCounter,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Commission items credited
    pub commission_credits: IntCounter,

    /// Operations enqueued for retry
    pub operations_enqueued: IntCounter,

    /// Successful replays
    pub replays_succeeded: IntCounter,

    /// Failed replays
    pub replays_failed: IntCounter,

    /// Operations dead-lettered
    pub dead_letters: IntCounter,

    /// Pending operations
    pub queue_depth: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let commits_total = counter(&registry, "loyalty_commits_total", "Balance commits applied")?;
        let commits_rejected = counter(
            &registry,
            "loyalty_commits_rejected_total",
            "Commits refused by validation",
        )?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("loyalty_commit_duration_seconds", "Histogram of commit latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        let commission_credits = counter(
            &registry,
            "loyalty_commission_credits_total",
            "Commission items credited",
        )?;
        let operations_enqueued = counter(
            &registry,
            "loyalty_operations_enqueued_total",
            "Operations sent to the retry queue",
        )?;
        let replays_succeeded = counter(
            &registry,
            "loyalty_replays_succeeded_total",
            "Queued operations replayed successfully",
        )?;
        let replays_failed = counter(
            &registry,
            "loyalty_replays_failed_total",
            "Queued operation replays that failed",
        )?;
        let dead_letters = counter(
            &registry,
            "loyalty_dead_letters_total",
            "Operations moved to the dead-letter list",
        )?;

        let queue_depth = IntGauge::new("loyalty_queue_depth", "Pending operations in the retry queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            commits_total,
            commits_rejected,
            commit_duration,
            commission_credits,
            operations_enqueued,
            replays_succeeded,
            replays_failed,
            dead_letters,
            queue_depth,
            registry,
        })
    }

    /// Record a commit and its latency
    pub fn record_commit(&self, duration_seconds: f64) {
        self.commits_total.inc();
        self.commit_duration.observe(duration_seconds);
    }

    /// Record a rejected commit
    pub fn record_rejection(&self) {
        self.commits_rejected.inc();
    }

    /// Record a commission credit
    pub fn record_commission_credit(&self) {
        self.commission_credits.inc();
    }

    /// Record an enqueue and the resulting depth
    pub fn record_enqueue(&self, depth: usize) {
        self.operations_enqueued.inc();
        self.queue_depth.set(depth as i64);
    }

    /// Record the outcome of a drain
    pub fn record_drain(&self, succeeded: usize, failed: usize, dead_lettered: usize, depth: usize) {
        self.replays_succeeded.inc_by(succeeded as u64);
        self.replays_failed.inc_by(failed as u64);
        self.dead_letters.inc_by(dead_lettered as u64);
        self.queue_depth.set(depth as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.commits_total.get(), 0);
        assert_eq!(metrics.queue_depth.get(), 0);
    }

    #[test]
    fn test_two_collectors_coexist() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_commit(0.002);
        assert_eq!(a.commits_total.get(), 1);
        assert_eq!(b.commits_total.get(), 0);
    }

    #[test]
    fn test_record_drain() {
        let metrics = Metrics::new().unwrap();
        metrics.record_enqueue(3);
        metrics.record_drain(2, 1, 1, 0);
        assert_eq!(metrics.operations_enqueued.get(), 1);
        assert_eq!(metrics.replays_succeeded.get(), 2);
        assert_eq!(metrics.dead_letters.get(), 1);
        assert_eq!(metrics.queue_depth.get(), 0);
    }

    #[test]
    fn test_registry_gathers() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection();
        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "loyalty_commits_rejected_total"));
    }
}
