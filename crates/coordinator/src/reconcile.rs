//! Resumes or fails jobs that stopped making progress.
//!
//! A task can vanish with its process, or aggregation can crash after the
//! last item was recorded. A periodic sweep finds aggregates whose
//! `last_update_at` is older than the staleness threshold and re-derives
//! the missing work from the item manifest.
//!
//! A job is only judged while the task queue is drained or no worker pool
//! is alive: tasks waiting behind another job's backlog are not lost.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use matchfan_core::config::{JobConfig, ReconcileConfig, Strictness};
use matchfan_core::{ItemId, JobAggregate, PartialEntry, SubjectId};
use matchfan_queue::{FetchTask, TaskQueue};
use matchfan_status::{JobStatus, StatusBoard};
use matchfan_store::JobState;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregateOutcome, Aggregator};
use crate::error::CoordinatorError;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub stale: usize,
    pub resumed: usize,
    /// Items re-enqueued across all resumed jobs.
    pub requeued: usize,
    pub finalized: usize,
    pub failed: usize,
    /// Stale jobs left alone because live workers still had queued tasks.
    pub deferred: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    state: JobState,
    queue: Arc<dyn TaskQueue>,
    aggregator: Aggregator,
    board: StatusBoard,
    config: ReconcileConfig,
    job: JobConfig,
    pool_name: String,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: JobState,
        queue: Arc<dyn TaskQueue>,
        aggregator: Aggregator,
        board: StatusBoard,
        config: ReconcileConfig,
        job: JobConfig,
        pool_name: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            queue,
            aggregator,
            board,
            config,
            job,
            pool_name: pool_name.into(),
            metrics,
        }
    }

    /// One pass over every live job.
    pub async fn sweep_once(&self) -> Result<SweepReport, CoordinatorError> {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let backlog = self.workers_busy().await?;

        for subject in self.state.list_jobs().await? {
            report.scanned += 1;
            let agg = match self.state.load_job(&subject).await {
                Ok(Some(agg)) => agg,
                Ok(None) => continue,
                Err(e) => {
                    error!(subject = %subject, error = %e, "unreadable job aggregate");
                    self.aggregator.fail(&subject, format!("unreadable job state: {e}")).await?;
                    report.failed += 1;
                    continue;
                }
            };
            if !agg.is_stale(now, self.config.stale_after()) {
                continue;
            }
            report.stale += 1;
            if backlog {
                debug!(subject = %subject, "queue still draining, deferring stale job");
                self.hold_lock(&subject).await?;
                report.deferred += 1;
                continue;
            }
            warn!(
                subject = %subject,
                processed = agg.processed,
                total = agg.total,
                resumes = agg.resumes,
                "stale job detected"
            );

            if let Err(e) = self.resume(&agg, &mut report).await {
                error!(subject = %subject, error = %e, "failed to reconcile job");
            }
        }

        if report.stale > 0 {
            info!(
                scanned = report.scanned,
                stale = report.stale,
                resumed = report.resumed,
                requeued = report.requeued,
                failed = report.failed,
                deferred = report.deferred,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// `true` while a live pool still has queued or delayed tasks to work
    /// through.
    async fn workers_busy(&self) -> Result<bool, CoordinatorError> {
        let health = match self.queue.health_check().await {
            Ok(health) => health,
            Err(e) => {
                warn!(error = %e, "queue health unavailable, judging stale jobs anyway");
                return Ok(false);
            }
        };
        if health.ready + health.delayed == 0 {
            return Ok(false);
        }
        Ok(self.state.last_heartbeat(&self.pool_name).await?.is_some())
    }

    /// Keep the dispatch lock alive for a job that is still being worked.
    async fn hold_lock(&self, subject: &SubjectId) -> Result<(), CoordinatorError> {
        if !self.state.extend_lock(subject, self.job.lock_ttl()).await? {
            self.state
                .try_acquire_lock(subject, "reconcile", self.job.lock_ttl())
                .await?;
        }
        Ok(())
    }

    async fn resume(
        &self,
        agg: &JobAggregate,
        report: &mut SweepReport,
    ) -> Result<(), CoordinatorError> {
        let subject = &agg.subject_id;

        if agg.resumes >= self.config.max_resumes {
            self.aggregator
                .fail(subject, format!("job stalled after {} resume(s)", agg.resumes))
                .await?;
            report.failed += 1;
            return Ok(());
        }

        let Some(manifest) = self.state.job_items(subject).await? else {
            self.aggregator.fail(subject, "item manifest missing".into()).await?;
            report.failed += 1;
            return Ok(());
        };

        let recorded = self.recorded_items(subject, &manifest).await?;
        let missing: Vec<ItemId> = manifest
            .iter()
            .filter(|id| !recorded.contains(*id))
            .cloned()
            .collect();

        // A claim left by a crashed aggregation would block the retry.
        self.state.release_finalize(subject).await?;
        let Some(processed) = self.state.recount_progress(agg, agg.resumes + 1).await? else {
            debug!(subject = %subject, "job finished or replaced during sweep");
            return Ok(());
        };
        self.hold_lock(subject).await?;
        self.metrics.record_resumed();
        report.resumed += 1;

        if missing.is_empty() || processed >= agg.total {
            info!(subject = %subject, total = agg.total, "all items recorded, finalizing");
            let outcome = self.aggregator.finalize(subject).await?;
            if matches!(outcome, AggregateOutcome::Completed { .. }) {
                report.finalized += 1;
            }
            return Ok(());
        }

        info!(
            subject = %subject,
            processed,
            missing = missing.len(),
            attempt = agg.resumes + 1,
            "resuming job"
        );
        report.requeued += missing.len();
        let tasks = missing
            .into_iter()
            .map(|id| FetchTask::for_job(agg, id))
            .collect();
        self.queue.push_all(tasks).await?;
        if let Err(e) = self
            .board
            .publish(subject, JobStatus::Progress { processed, total: agg.total })
            .await
        {
            warn!(subject = %subject, error = %e, "failed to publish progress");
        }
        Ok(())
    }

    /// Item ids whose recorded entry is accepted under the configured strictness.
    async fn recorded_items(
        &self,
        subject: &SubjectId,
        manifest: &[ItemId],
    ) -> Result<HashSet<ItemId>, CoordinatorError> {
        let raw = self.state.raw_entries(subject).await?;
        match self.config.strictness {
            Strictness::Trust => Ok(raw.into_keys().collect()),
            Strictness::Verify => {
                let known: HashSet<&ItemId> = manifest.iter().collect();
                let mut kept = HashSet::new();
                let mut dropped = Vec::new();
                for (item_id, value) in raw {
                    let accepted = known.contains(&item_id)
                        && serde_json::from_str::<PartialEntry>(&value)
                            .map(|e| e.item_id == item_id && !e.is_tombstone())
                            .unwrap_or(false);
                    if accepted {
                        kept.insert(item_id);
                    } else {
                        dropped.push(item_id);
                    }
                }
                if !dropped.is_empty() {
                    debug!(
                        subject = %subject,
                        dropped = dropped.len(),
                        "dropping unverified entries"
                    );
                    self.state.remove_entries(subject, &dropped).await?;
                }
                Ok(kept)
            }
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let period = self.config.sweep_interval().max(std::time::Duration::from_secs(1));
        info!(
            every_secs = period.as_secs(),
            strictness = %self.config.strictness,
            "reconciler started"
        );
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        // Registered up front so a notify during a sweep is not lost.
        let stopped = shutdown.notified();
        tokio::pin!(stopped);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "reconciliation sweep failed");
                    }
                }
                _ = &mut stopped => break,
            }
        }
        info!("reconciler stopped");
    }
}
