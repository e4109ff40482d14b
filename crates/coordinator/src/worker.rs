//! Fetch workers and the pool that runs them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use matchfan_core::config::{JobConfig, RateConfig, WorkerPoolConfig};
use matchfan_core::{JobAggregate, PartialEntry};
use matchfan_queue::{FetchTask, TaskQueue};
use matchfan_status::{JobStatus, StatusBoard};
use matchfan_store::{JobState, Recorded};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::error::CoordinatorError;
use crate::metrics::Metrics;
use crate::rate_gate::RateGate;
use crate::remote::{RemoteError, RemoteFetch};
use crate::retry::{RetryDecision, RetryPolicy};

/// What happened to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Entry recorded; `processed` is the new counter value.
    Recorded { processed: u64, total: u64, tombstone: bool },
    /// Recorded and this worker ran aggregation.
    Finalized,
    /// Re-enqueued for another attempt.
    Retried { attempt: u32 },
    /// An entry for this item already existed.
    Duplicate,
    /// The job no longer exists.
    Skipped,
}

#[derive(Clone)]
pub struct FetchWorker {
    state: JobState,
    queue: Arc<dyn TaskQueue>,
    remote: Arc<dyn RemoteFetch>,
    gate: Arc<dyn RateGate>,
    board: StatusBoard,
    aggregator: Aggregator,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    job: JobConfig,
    rate: RateConfig,
    metrics: Arc<Metrics>,
}

impl FetchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: JobState,
        queue: Arc<dyn TaskQueue>,
        remote: Arc<dyn RemoteFetch>,
        gate: Arc<dyn RateGate>,
        board: StatusBoard,
        aggregator: Aggregator,
        retry: RetryPolicy,
        fetch_timeout: Duration,
        job: JobConfig,
        rate: RateConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            queue,
            remote,
            gate,
            board,
            aggregator,
            retry,
            fetch_timeout,
            job,
            rate,
            metrics,
        }
    }

    /// Process one task end to end.
    pub async fn handle(&self, task: FetchTask) -> Result<TaskOutcome, CoordinatorError> {
        let subject = &task.subject_id;
        let Some(agg) = self.state.load_job(subject).await? else {
            debug!(subject = %subject, item_id = %task.item_id, "job gone, dropping task");
            return Ok(TaskOutcome::Skipped);
        };
        if task.job_id != agg.job_id {
            debug!(
                subject = %subject,
                item_id = %task.item_id,
                task_job = %task.job_id,
                live_job = %agg.job_id,
                "task from an earlier job, dropping"
            );
            return Ok(TaskOutcome::Skipped);
        }
        if self.state.has_entry(subject, &task.item_id).await? {
            debug!(subject = %subject, item_id = %task.item_id, "item already recorded");
            return Ok(TaskOutcome::Duplicate);
        }

        self.gate.acquire().await?;
        // Waiting on the gate counts as progress for the stale sweep.
        self.state.touch_job(subject).await?;
        let result = match tokio::time::timeout(
            self.fetch_timeout,
            self.remote.fetch_item(&task.region, &task.item_id, &task.player_ref),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "timed out after {}ms",
                self.fetch_timeout.as_millis()
            ))),
        };

        let entry = match result {
            Ok(summary) => {
                self.metrics.record_fetched();
                PartialEntry::payload(summary)
            }
            Err(err) => {
                let mut delay = None;
                if let RemoteError::RateLimited { retry_after } = &err {
                    let backoff = retry_after.unwrap_or_else(|| self.rate.default_backoff());
                    self.metrics.record_rate_limited();
                    self.gate.penalize(backoff).await?;
                    delay = Some(backoff);
                }
                match self.retry.decide(task.attempt + 1, err.kind()) {
                    RetryDecision::RetryAfter(backoff) => {
                        return self.requeue(&task, delay.unwrap_or(backoff), &err).await;
                    }
                    RetryDecision::NoRetry => {
                        warn!(
                            subject = %subject,
                            item_id = %task.item_id,
                            attempt = task.attempt + 1,
                            error = %err,
                            "item tombstoned"
                        );
                        self.metrics.record_tombstoned();
                        PartialEntry::tombstone(task.item_id.clone(), err.to_string())
                    }
                }
            }
        };

        self.record(&task, &agg, entry).await
    }

    async fn requeue(
        &self,
        task: &FetchTask,
        delay: Duration,
        err: &RemoteError,
    ) -> Result<TaskOutcome, CoordinatorError> {
        let next = task.next_attempt();
        let attempt = next.attempt;
        debug!(
            subject = %task.subject_id,
            item_id = %task.item_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "re-enqueueing item"
        );
        self.queue.push_after(next, delay).await?;
        self.metrics.record_retried();
        // A job waiting on retries is not stale.
        self.state.touch_job(&task.subject_id).await?;
        Ok(TaskOutcome::Retried { attempt })
    }

    async fn record(
        &self,
        task: &FetchTask,
        agg: &JobAggregate,
        entry: PartialEntry,
    ) -> Result<TaskOutcome, CoordinatorError> {
        let subject = &task.subject_id;
        let total = agg.total;
        let tombstone = entry.is_tombstone();
        let processed = match self.state.record_entry(agg, &entry).await? {
            Recorded::Counted(processed) => processed,
            Recorded::Duplicate => {
                debug!(subject = %subject, item_id = %task.item_id, "duplicate delivery ignored");
                return Ok(TaskOutcome::Duplicate);
            }
            Recorded::JobGone => {
                debug!(subject = %subject, item_id = %task.item_id, "job finished before record");
                return Ok(TaskOutcome::Skipped);
            }
        };
        self.state.extend_lock(subject, self.job.lock_ttl()).await?;

        if let Err(e) = self
            .board
            .publish(subject, JobStatus::Progress { processed, total })
            .await
        {
            warn!(subject = %subject, error = %e, "failed to publish progress");
        }

        if processed == total {
            info!(subject = %subject, total, "last item recorded, aggregating");
            self.aggregator.finalize(subject).await?;
            return Ok(TaskOutcome::Finalized);
        }
        Ok(TaskOutcome::Recorded {
            processed,
            total,
            tombstone,
        })
    }
}

/// Bounded pool of worker loops draining the task queue.
///
/// Pool size is independent of the rate gate: extra workers just wait on it.
pub struct WorkerPool {
    worker: Arc<FetchWorker>,
    queue: Arc<dyn TaskQueue>,
    state: JobState,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        worker: Arc<FetchWorker>,
        queue: Arc<dyn TaskQueue>,
        state: JobState,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            worker,
            queue,
            state,
            config,
        }
    }

    /// Run until `shutdown` is notified. In-flight tasks finish first.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), CoordinatorError> {
        let stopped = shutdown.notified();
        let count = self.config.count.max(1);
        info!(pool = %self.config.pool_name, workers = count, "starting worker pool");

        let stopping = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());

        let mut loops = Vec::with_capacity(count + 1);
        for id in 0..count {
            let worker = self.worker.clone();
            let queue = self.queue.clone();
            let stopping = stopping.clone();
            let stop = stop.clone();
            let poll_timeout = self.config.poll_timeout();
            loops.push(tokio::spawn(async move {
                Self::worker_loop(id, worker, queue, poll_timeout, stopping, stop).await;
            }));
        }

        let heartbeat = {
            let state = self.state.clone();
            let queue = self.queue.clone();
            let config = self.config.clone();
            let stop = stop.clone();
            tokio::spawn(async move { Self::heartbeat_loop(state, queue, config, stop).await })
        };

        stopped.await;
        info!(pool = %self.config.pool_name, "worker pool stopping");
        stopping.store(true, Ordering::SeqCst);
        stop.notify_waiters();

        heartbeat.abort();
        for result in join_all(loops).await {
            if let Err(e) = result {
                error!(error = %e, "worker loop panicked");
            }
        }
        info!(pool = %self.config.pool_name, "worker pool stopped");
        Ok(())
    }

    async fn worker_loop(
        id: usize,
        worker: Arc<FetchWorker>,
        queue: Arc<dyn TaskQueue>,
        poll_timeout: Duration,
        stopping: Arc<AtomicBool>,
        stop: Arc<Notify>,
    ) {
        debug!(worker = id, "worker loop started");
        while !stopping.load(Ordering::SeqCst) {
            let polled = tokio::select! {
                polled = queue.poll(poll_timeout) => polled,
                _ = stop.notified() => break,
            };
            match polled {
                Ok(Some(task)) => {
                    let item_id = task.item_id.clone();
                    let subject = task.subject_id.clone();
                    if let Err(e) = worker.handle(task).await {
                        // The gap is picked up by reconciliation.
                        error!(
                            worker = id,
                            subject = %subject,
                            item_id = %item_id,
                            error = %e,
                            "task failed"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = id, error = %e, "queue poll failed");
                    tokio::time::sleep(poll_timeout).await;
                }
            }
        }
        debug!(worker = id, "worker loop stopped");
    }

    async fn heartbeat_loop(
        state: JobState,
        queue: Arc<dyn TaskQueue>,
        config: WorkerPoolConfig,
        stop: Arc<Notify>,
    ) {
        let interval = config.heartbeat_interval().max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let health = queue.health_check().await.ok();
                    let payload = serde_json::json!({
                        "pool": config.pool_name,
                        "workers": config.count,
                        "ready": health.as_ref().map(|h| h.ready),
                        "delayed": health.as_ref().map(|h| h.delayed),
                        "at": Utc::now().to_rfc3339(),
                    });
                    let written = state
                        .heartbeat(&config.pool_name, &payload.to_string(), interval * 2)
                        .await;
                    if let Err(e) = written {
                        warn!(pool = %config.pool_name, error = %e, "failed to write heartbeat");
                    }
                }
                _ = stop.notified() => break,
            }
        }
    }
}
