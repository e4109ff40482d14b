//! Fan-in: turn a finished job's partial results into the cached artifact.

use std::sync::Arc;

use chrono::Utc;
use matchfan_core::config::JobConfig;
use matchfan_core::{CachedArtifact, ItemOutcome, SubjectId, Tombstone};
use matchfan_status::{JobStatus, StatusBoard};
use matchfan_store::JobState;
use tracing::{error, info, warn};

use crate::error::CoordinatorError;
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    Completed { matches: usize, tombstones: usize },
    Failed { reason: String },
    /// Someone else already finalized (or is finalizing) this job.
    AlreadyClaimed,
    /// No job state left to aggregate.
    Missing,
}

#[derive(Clone)]
pub struct Aggregator {
    state: JobState,
    board: StatusBoard,
    job: JobConfig,
    metrics: Arc<Metrics>,
}

impl Aggregator {
    pub fn new(state: JobState, board: StatusBoard, job: JobConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            state,
            board,
            job,
            metrics,
        }
    }

    /// Finalize a job whose `processed` reached `total`.
    ///
    /// Guarded by a one-shot claim, so concurrent or repeated triggers
    /// produce at most one artifact.
    pub async fn finalize(
        &self,
        subject: &SubjectId,
    ) -> Result<AggregateOutcome, CoordinatorError> {
        if !self.state.claim_finalize(subject, self.job.lock_ttl()).await? {
            info!(subject = %subject, "aggregation already claimed");
            return Ok(AggregateOutcome::AlreadyClaimed);
        }

        let Some(agg) = self.state.load_job(subject).await? else {
            warn!(subject = %subject, "aggregation triggered without job state");
            self.state.release_finalize(subject).await?;
            return Ok(AggregateOutcome::Missing);
        };

        let entries = self.state.entries(subject).await?;
        let found = entries.len() as u64;

        if agg.total > 0 && entries.is_empty() {
            return self.fail(subject, "no results were recorded".into()).await;
        }
        if found != agg.total {
            let err = CoordinatorError::Consistency {
                subject: subject.to_string(),
                expected: agg.total,
                found,
            };
            error!(subject = %subject, expected = agg.total, found, "{err}");
            return self.fail(subject, err.to_string()).await;
        }

        let mut matches = Vec::with_capacity(entries.len());
        let mut tombstones = Vec::new();
        for entry in entries {
            match entry.outcome {
                ItemOutcome::Payload(summary) => matches.push(summary),
                ItemOutcome::Tombstone { reason } => tombstones.push(Tombstone {
                    item_id: entry.item_id,
                    reason,
                }),
            }
        }

        if matches.is_empty() {
            return self
                .fail(subject, format!("all {} items failed to fetch", tombstones.len()))
                .await;
        }

        matches.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.match_id.cmp(&b.match_id))
        });
        tombstones.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        let fetched_at = Utc::now();
        let ttl = self.job.cache_ttl();
        let expires_at = fetched_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let artifact = CachedArtifact {
            subject_id: subject.clone(),
            matches,
            tombstones,
            total: agg.total,
            fetched_at,
            expires_at,
        };

        self.state.write_artifact(&artifact, ttl).await?;
        self.state.set_cooldown(subject, self.job.cooldown()).await?;
        self.state.clear_job(subject).await?;
        self.metrics.record_aggregated();

        if let Err(e) = self.board.publish(subject, JobStatus::Completed).await {
            warn!(subject = %subject, error = %e, "failed to publish completion");
        }
        info!(
            subject = %subject,
            matches = artifact.matches.len(),
            tombstones = artifact.tombstones.len(),
            "job aggregated"
        );
        Ok(AggregateOutcome::Completed {
            matches: artifact.matches.len(),
            tombstones: artifact.tombstones.len(),
        })
    }

    /// Drop job state, release the lock and report `failed`.
    pub async fn fail(
        &self,
        subject: &SubjectId,
        reason: String,
    ) -> Result<AggregateOutcome, CoordinatorError> {
        self.state.clear_job(subject).await?;
        self.metrics.record_failed();
        warn!(subject = %subject, reason = %reason, "job failed");
        if let Err(e) = self.board.publish(subject, JobStatus::failed(reason.clone())).await {
            warn!(subject = %subject, error = %e, "failed to publish failure");
        }
        Ok(AggregateOutcome::Failed { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchfan_core::{JobAggregate, MatchOutcome, MatchSummary, PartialEntry};
    use matchfan_status::BroadcastHub;
    use matchfan_store::MemoryStore;
    use std::time::Duration;

    fn setup() -> (Aggregator, JobState) {
        let state = JobState::new(Arc::new(MemoryStore::new()));
        let board = StatusBoard::new(
            state.clone(),
            Arc::new(BroadcastHub::new()),
            Duration::from_secs(60),
        );
        let agg = Aggregator::new(
            state.clone(),
            board,
            JobConfig::default(),
            Arc::new(Metrics::new()),
        );
        (agg, state)
    }

    fn subject() -> SubjectId {
        SubjectId::from_raw("a#b@euw")
    }

    fn payload(id: &str, ts: i64) -> PartialEntry {
        PartialEntry::payload(MatchSummary {
            match_id: id.into(),
            timestamp: ts,
            outcome: MatchOutcome::Win,
            champion: "Lux".into(),
            role: "UTILITY".into(),
        })
    }

    async fn job(state: &JobState, entries: Vec<PartialEntry>, total: u64) {
        let items: Vec<String> = entries.iter().map(|e| e.item_id.clone()).collect();
        let agg = JobAggregate::new(subject(), "euw", "p", total);
        state.create_job(&agg, &items).await.unwrap();
        for e in &entries {
            state.record_entry(&agg, e).await.unwrap();
        }
    }

    #[tokio::test]
    async fn artifact_is_sorted_newest_first() {
        let (aggregator, state) = setup();
        job(&state, vec![payload("m1", 10), payload("m2", 30), payload("m3", 20)], 3).await;

        let outcome = aggregator.finalize(&subject()).await.unwrap();
        assert_eq!(outcome, AggregateOutcome::Completed { matches: 3, tombstones: 0 });

        let artifact = state.cached_artifact(&subject()).await.unwrap().unwrap();
        let order: Vec<_> = artifact.matches.iter().map(|m| m.match_id.as_str()).collect();
        assert_eq!(order, vec!["m2", "m3", "m1"]);
        assert!(state.cooldown_remaining(&subject()).await.unwrap().is_some());
        assert!(state.load_job(&subject()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_trigger_is_a_no_op() {
        let (aggregator, state) = setup();
        job(&state, vec![payload("m1", 1)], 1).await;
        assert!(matches!(
            aggregator.finalize(&subject()).await.unwrap(),
            AggregateOutcome::Completed { .. }
        ));
        // Claim key is cleared with the job, so a late trigger finds nothing.
        assert_eq!(aggregator.finalize(&subject()).await.unwrap(), AggregateOutcome::Missing);
    }

    #[tokio::test]
    async fn count_mismatch_fails_without_artifact() {
        let (aggregator, state) = setup();
        job(&state, vec![payload("m1", 1), payload("m2", 2)], 3).await;
        assert!(matches!(
            aggregator.finalize(&subject()).await.unwrap(),
            AggregateOutcome::Failed { .. }
        ));
        assert!(state.cached_artifact(&subject()).await.unwrap().is_none());
        assert!(!state.lock_held(&subject()).await.unwrap());
    }

    #[tokio::test]
    async fn only_tombstones_fails() {
        let (aggregator, state) = setup();
        job(&state, vec![PartialEntry::tombstone("m1", "gone")], 1).await;
        assert!(matches!(
            aggregator.finalize(&subject()).await.unwrap(),
            AggregateOutcome::Failed { .. }
        ));
        assert!(state.cached_artifact(&subject()).await.unwrap().is_none());
    }
}
