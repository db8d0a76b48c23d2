/*!
 * Pump counters shared by all lanes
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PumpCounters {
    received: AtomicU64,
    sent: AtomicU64,
    completed: AtomicU64,
    dead_lettered: AtomicU64,
    transient_retries: AtomicU64,
    permanent_failures: AtomicU64,
    empty_polls: AtomicU64,
}

impl PumpCounters {
    pub fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PumpMetrics {
        PumpMetrics {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pump-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpMetrics {
    pub received: u64,
    pub sent: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub transient_retries: u64,
    pub permanent_failures: u64,
    pub empty_polls: u64,
}

impl PumpMetrics {
    pub fn summary(&self) -> String {
        format!(
            "received={} sent={} completed={} dead_lettered={} retries={} permanent_failures={}",
            self.received,
            self.sent,
            self.completed,
            self.dead_lettered,
            self.transient_retries,
            self.permanent_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let counters = PumpCounters::default();
        counters.received();
        counters.received();
        counters.sent();
        counters.transient_retry();

        let metrics = counters.snapshot();
        assert_eq!(metrics.received, 2);
        assert_eq!(metrics.sent, 1);
        assert_eq!(metrics.transient_retries, 1);
        assert_eq!(metrics.completed, 0);
    }

    #[test]
    fn test_summary() {
        let metrics = PumpMetrics {
            received: 3,
            sent: 4,
            completed: 3,
            ..Default::default()
        };
        assert_eq!(
            metrics.summary(),
            "received=3 sent=4 completed=3 dead_lettered=0 retries=0 permanent_failures=0"
        );
    }
}
