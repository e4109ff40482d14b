//! Cluster-wide admission control for outbound calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use matchfan_store::JobState;
use tracing::{debug, info};

use crate::error::CoordinatorError;
use crate::now_ms;

/// At most one outbound call per interval, across every worker.
#[async_trait]
pub trait RateGate: Send + Sync {
    /// Wait for the next free slot.
    async fn acquire(&self) -> Result<(), CoordinatorError>;

    /// Hold every caller back for `backoff` from now.
    async fn penalize(&self, backoff: Duration) -> Result<(), CoordinatorError>;
}

#[async_trait]
impl<T: RateGate + ?Sized> RateGate for Arc<T> {
    async fn acquire(&self) -> Result<(), CoordinatorError> {
        (**self).acquire().await
    }

    async fn penalize(&self, backoff: Duration) -> Result<(), CoordinatorError> {
        (**self).penalize(backoff).await
    }
}

/// Gate backed by the shared `rate:next` / `rate:penalty` keys.
///
/// Each acquisition reserves `start = max(next, now)` and advances `next`
/// by one interval in a single store operation, then sleeps until `start`.
#[derive(Clone)]
pub struct StoreRateGate {
    state: JobState,
    interval: Duration,
}

impl StoreRateGate {
    pub fn new(state: JobState, interval: Duration) -> Self {
        Self { state, interval }
    }
}

#[async_trait]
impl RateGate for StoreRateGate {
    async fn acquire(&self) -> Result<(), CoordinatorError> {
        let step = self.interval.as_millis() as i64;
        loop {
            let now = now_ms();
            let start = self.state.rate_reserve(now, step).await?;
            if start > now {
                tokio::time::sleep(Duration::from_millis((start - now) as u64)).await;
            }

            // A penalty may have landed while we slept.
            match self.state.penalty_until().await? {
                Some(until) if until > start => {
                    debug!(until, slot = start, "slot fell inside a penalty, re-reserving");
                    continue;
                }
                _ => return Ok(()),
            }
        }
    }

    async fn penalize(&self, backoff: Duration) -> Result<(), CoordinatorError> {
        let until = now_ms() + backoff.as_millis() as i64;
        // Keep the marker a little past its deadline so late wakers still see it.
        let ttl = backoff + self.interval + Duration::from_secs(1);
        self.state.rate_penalize(until, ttl).await?;
        info!(backoff_ms = backoff.as_millis() as u64, "rate gate penalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchfan_store::MemoryStore;
    use std::time::Instant;

    fn gate(interval_ms: u64) -> StoreRateGate {
        StoreRateGate::new(
            JobState::new(Arc::new(MemoryStore::new())),
            Duration::from_millis(interval_ms),
        )
    }

    #[tokio::test]
    async fn acquisitions_are_spaced_by_interval() {
        let gate = gate(40);
        let started = Instant::now();
        for _ in 0..4 {
            gate.acquire().await.unwrap();
        }
        // First slot is immediate, the next three wait one interval each.
        assert!(started.elapsed() >= Duration::from_millis(115));
    }

    #[tokio::test]
    async fn concurrent_acquirers_share_one_timeline() {
        let gate = Arc::new(gate(30));
        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.acquire().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(115));
    }

    #[tokio::test]
    async fn penalty_delays_later_acquisitions() {
        let gate = gate(5);
        gate.acquire().await.unwrap();
        let penalized_at = Instant::now();
        gate.penalize(Duration::from_millis(150)).await.unwrap();

        gate.acquire().await.unwrap();
        assert!(penalized_at.elapsed() >= Duration::from_millis(145));
    }
}
