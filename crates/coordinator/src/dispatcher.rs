//! Fan-out: turn a request for a player into one fetch task per match.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use matchfan_core::config::{ApiConfig, JobConfig};
use matchfan_core::{CachedArtifact, CoreError, ItemId, JobAggregate, PlayerHandle, SubjectId};
use matchfan_queue::{FetchTask, TaskQueue};
use matchfan_status::{JobStatus, StatusBoard};
use matchfan_store::JobState;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::metrics::Metrics;
use crate::rate_gate::RateGate;
use crate::remote::{RemoteError, RemoteFetch};
use crate::retry::{RetryDecision, RetryPolicy};

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub handle: PlayerHandle,
    /// Skip the cache check (cooldown and lock still apply).
    pub force_refresh: bool,
}

impl DispatchRequest {
    pub fn new(handle: PlayerHandle) -> Self {
        Self {
            handle,
            force_refresh: false,
        }
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Fresh data already cached; nothing dispatched.
    Cached(Box<CachedArtifact>),
    CooldownActive { remaining: Duration },
    JobInProgress,
    Started { subject: SubjectId, total: u64 },
    NoMatches { subject: SubjectId },
}

#[derive(Clone)]
pub struct Dispatcher {
    state: JobState,
    queue: Arc<dyn TaskQueue>,
    remote: Arc<dyn RemoteFetch>,
    gate: Arc<dyn RateGate>,
    board: StatusBoard,
    api: ApiConfig,
    job: JobConfig,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: JobState,
        queue: Arc<dyn TaskQueue>,
        remote: Arc<dyn RemoteFetch>,
        gate: Arc<dyn RateGate>,
        board: StatusBoard,
        api: ApiConfig,
        job: JobConfig,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            queue,
            remote,
            gate,
            board,
            api,
            job,
            retry,
            metrics,
        }
    }

    /// Check cache, cooldown and lock in that order, then start a job.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> Result<DispatchOutcome, CoordinatorError> {
        let handle = &request.handle;
        let subject = match handle.subject_id() {
            Ok(s) => s,
            Err(CoreError::InvalidRegion(region)) => {
                return Err(CoordinatorError::IdentityNotFound(format!(
                    "unsupported region '{region}'"
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if !request.force_refresh {
            if let Some(artifact) = self.state.cached_artifact(&subject).await? {
                debug!(subject = %subject, "serving cached artifact");
                return Ok(DispatchOutcome::Cached(Box::new(artifact)));
            }
        }

        if let Some(remaining) = self.state.cooldown_remaining(&subject).await? {
            return Ok(DispatchOutcome::CooldownActive { remaining });
        }

        let token = Uuid::new_v4().to_string();
        if !self
            .state
            .try_acquire_lock(&subject, &token, self.job.lock_ttl())
            .await?
        {
            return Ok(DispatchOutcome::JobInProgress);
        }
        // A job whose lock lapsed while its tasks waited in the queue is
        // still live; only the reconciler may retire it.
        if self.state.job_exists(&subject).await? {
            debug!(subject = %subject, "job still live without a lock");
            self.state.release_lock(&subject).await?;
            return Ok(DispatchOutcome::JobInProgress);
        }

        self.board.begin(&subject).await?;
        info!(subject = %subject, force = request.force_refresh, "dispatch accepted");

        match self.start_job(&subject, handle).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(subject = %subject, error = %e, "dispatch failed");
                if let Err(cleanup) = self.state.clear_job(&subject).await {
                    warn!(
                        subject = %subject,
                        error = %cleanup,
                        "failed to clean up after dispatch error"
                    );
                }
                self.metrics.record_failed();
                if let Err(publish) = self
                    .board
                    .publish(&subject, JobStatus::failed(e.to_string()))
                    .await
                {
                    warn!(
                        subject = %subject,
                        error = %publish,
                        "failed to publish dispatch failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn start_job(
        &self,
        subject: &SubjectId,
        handle: &PlayerHandle,
    ) -> Result<DispatchOutcome, CoordinatorError> {
        let player_ref = self
            .call_remote("resolve identity", move || self.remote.resolve_identity(handle))
            .await
            .map_err(|e| match e {
                CoordinatorError::Remote(RemoteError::NotFound(_)) => {
                    CoordinatorError::IdentityNotFound(format!("player {handle} not found"))
                }
                other => other,
            })?;

        let items = self.enumerate(&handle.region, &player_ref).await?;
        if items.is_empty() {
            info!(subject = %subject, "no matches found");
            self.state.release_lock(subject).await?;
            self.board.publish(subject, JobStatus::NoMatches).await?;
            return Ok(DispatchOutcome::NoMatches {
                subject: subject.clone(),
            });
        }

        let total = items.len() as u64;
        let region = handle.region.trim().to_lowercase();
        let agg = JobAggregate::new(subject.clone(), region, player_ref, total);
        self.state.create_job(&agg, &items).await?;
        self.board
            .publish(subject, JobStatus::Progress { processed: 0, total })
            .await?;

        let tasks = items
            .iter()
            .map(|id| FetchTask::for_job(&agg, id.clone()))
            .collect();
        self.queue.push_all(tasks).await?;
        self.metrics.record_dispatched();

        info!(subject = %subject, total, "job fanned out");
        Ok(DispatchOutcome::Started {
            subject: subject.clone(),
            total,
        })
    }

    /// Page through match ids until `games_to_fetch` or a short page.
    async fn enumerate(
        &self,
        region: &str,
        player_ref: &str,
    ) -> Result<Vec<ItemId>, CoordinatorError> {
        let limit = self.api.games_to_fetch as usize;
        let page_size = self.api.ids_page_size.max(1) as usize;
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut start = 0usize;

        while items.len() < limit {
            let count = page_size.min(limit - items.len());
            let page = self
                .call_remote("list match ids", move || {
                    self.remote
                        .list_item_ids(region, player_ref, start as u32, count as u32)
                })
                .await?;
            let got = page.len();
            start += got;
            items.extend(page.into_iter().filter(|id| seen.insert(id.clone())));
            if got < count {
                break;
            }
        }
        items.truncate(limit);
        Ok(items)
    }

    /// One gated remote call with rate-limit penalties and transient retries.
    async fn call_remote<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.gate.acquire().await?;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if let RemoteError::RateLimited { retry_after } = &err {
                self.metrics.record_rate_limited();
                self.gate.penalize(retry_after.unwrap_or(self.retry.base_delay)).await?;
            }
            match self.retry.decide(attempt, err.kind()) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    self.metrics.record_retried();
                    // Throttled calls already wait on the gate.
                    if !matches!(err, RemoteError::RateLimited { .. }) {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::NoRetry => return Err(err.into()),
            }
        }
    }
}
