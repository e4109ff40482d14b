//! In-process counters for the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    dispatched: AtomicU64,
    fetched: AtomicU64,
    tombstoned: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
    aggregated: AtomicU64,
    failed: AtomicU64,
    resumed: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub fetched: u64,
    pub tombstoned: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub aggregated: u64,
    pub failed: u64,
    pub resumed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tombstoned(&self) {
        self.tombstoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregated(&self) {
        self.aggregated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resumed(&self) {
        self.resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            tombstoned: self.tombstoned.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            aggregated: self.aggregated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::new();
        m.record_fetched();
        m.record_fetched();
        m.record_tombstoned();
        let snap = m.snapshot();
        assert_eq!(snap.fetched, 2);
        assert_eq!(snap.tombstoned, 1);
        assert_eq!(snap.aggregated, 0);

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["fetched"], 2);
    }
}
