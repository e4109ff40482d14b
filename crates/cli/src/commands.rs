//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use matchfan_coordinator::{
    Aggregator, Coordinator, DispatchOutcome, DispatchRequest, Metrics, Reconciler, RiotClient,
};
use matchfan_core::{Config, MatchSummary, PlayerHandle};
use matchfan_queue::TaskQueue;
use matchfan_status::{BroadcastHub, JobStatus, StatusBoard, StatusSubscriber};
use matchfan_store::{JobState, KvStore};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Connected store, queue and in-process status hub.
pub struct Backends {
    config: Config,
    store: Arc<dyn KvStore>,
    queue: Arc<dyn TaskQueue>,
    hub: BroadcastHub,
}

impl Backends {
    pub async fn connect(config: Config) -> Result<Self> {
        let store = matchfan_store::connect(&config.store)
            .await
            .context("failed to connect state store")?;
        let queue = matchfan_queue::connect(&config.store, &config.workers.pool_name)
            .await
            .context("failed to connect task queue")?;
        match queue.health_check().await {
            Ok(health) => info!("{health}"),
            Err(e) => warn!(error = %e, "queue health check failed"),
        }
        Ok(Self {
            config,
            store,
            queue,
            hub: BroadcastHub::new(),
        })
    }

    fn state(&self) -> JobState {
        JobState::new(self.store.clone())
    }

    fn board(&self) -> StatusBoard {
        StatusBoard::new(self.state(), Arc::new(self.hub.clone()), self.config.job.cache_ttl())
    }

    /// Full component graph; needs a Riot API key.
    fn coordinator(&self) -> Result<Coordinator> {
        let remote = RiotClient::new(&self.config.api, &self.config.fetch, &self.config.rate)
            .context("failed to build Riot API client")?;
        Ok(Coordinator::new(
            self.config.clone(),
            self.store.clone(),
            self.queue.clone(),
            Arc::new(remote),
            Arc::new(self.hub.clone()),
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Long-running service: worker pool plus reconciler.
pub async fn run(backends: &Backends) -> Result<()> {
    let coordinator = backends.coordinator()?;
    let shutdown = Arc::new(Notify::new());

    let pool = coordinator.worker_pool();
    let pool_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };
    let reconciler_task = {
        let reconciler = coordinator.reconciler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };
    let metrics_task = {
        let metrics = coordinator.metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_metrics(&metrics);
            }
        })
    };

    info!("matchfan running, press Ctrl+C to stop");
    shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.notify_waiters();

    pool_task
        .await
        .context("worker pool task panicked")?
        .context("worker pool failed")?;
    reconciler_task.await.context("reconciler task panicked")?;
    metrics_task.abort();
    log_metrics(&coordinator.metrics);
    info!("matchfan exited cleanly");
    Ok(())
}

fn log_metrics(metrics: &Metrics) {
    let m = metrics.snapshot();
    info!(
        dispatched = m.dispatched,
        fetched = m.fetched,
        tombstoned = m.tombstoned,
        retried = m.retried,
        rate_limited = m.rate_limited,
        aggregated = m.aggregated,
        failed = m.failed,
        resumed = m.resumed,
        "metrics"
    );
}

/// Dispatch one player and drive the job with an in-process pool.
pub async fn fetch(
    backends: &Backends,
    handle: PlayerHandle,
    force: bool,
    timeout: Duration,
) -> Result<()> {
    let coordinator = backends.coordinator()?;
    let subject = handle.subject_id().context("invalid player handle")?;
    let subscription = backends.hub.subscribe(Some(subject.clone()));

    let request = DispatchRequest::new(handle.clone()).force_refresh(force);
    let outcome = coordinator
        .dispatcher
        .dispatch(&request)
        .await
        .with_context(|| format!("dispatch for {handle} failed"))?;

    let total = match outcome {
        DispatchOutcome::Cached(artifact) => {
            println!("cached history for {handle}: {} matches", artifact.len());
            return print_matches(&artifact.matches);
        }
        DispatchOutcome::CooldownActive { remaining } => {
            println!("{handle} was refreshed recently, retry in {}s", remaining.as_secs());
            return Ok(());
        }
        DispatchOutcome::JobInProgress => {
            println!("a fetch for {handle} is already running");
            return Ok(());
        }
        DispatchOutcome::NoMatches { .. } => {
            println!("no ranked matches found for {handle}");
            return Ok(());
        }
        DispatchOutcome::Started { total, .. } => total,
    };
    println!("fetching {total} matches for {handle}");

    let shutdown = Arc::new(Notify::new());
    let pool = coordinator.worker_pool();
    let pool_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let followed = tokio::time::timeout(timeout, async {
        loop {
            let event = subscription.recv().await?;
            if event.status.is_terminal() {
                return Ok::<_, anyhow::Error>(event.status);
            }
            if let JobStatus::Progress { processed, total } = event.status {
                println!("  {processed}/{total}");
            }
        }
    })
    .await;

    shutdown.notify_waiters();
    pool_task
        .await
        .context("worker pool task panicked")?
        .context("worker pool failed")?;
    log_metrics(&coordinator.metrics);

    match followed {
        Err(_) => bail!(
            "gave up after {}s; the job continues under `matchfan run`",
            timeout.as_secs()
        ),
        Ok(Err(e)) => Err(e.context("status stream closed")),
        Ok(Ok(JobStatus::Completed)) => {
            let artifact = backends
                .state()
                .cached_artifact(&subject)
                .await?
                .context("job completed but no history was cached")?;
            println!(
                "completed: {} matches, {} unavailable",
                artifact.len(),
                artifact.tombstones.len()
            );
            print_matches(&artifact.matches)
        }
        Ok(Ok(JobStatus::Failed { error })) => bail!("fetch for {handle} failed: {error}"),
        Ok(Ok(other)) => {
            println!("finished: {}", other.name());
            Ok(())
        }
    }
}

fn print_matches(matches: &[MatchSummary]) -> Result<()> {
    for m in matches {
        println!(
            "{:<16} {:>14} {:?} {:<12} {}",
            m.match_id, m.timestamp, m.outcome, m.champion, m.role
        );
    }
    Ok(())
}

pub async fn status(backends: &Backends, handle: PlayerHandle) -> Result<()> {
    let subject = handle.subject_id().context("invalid player handle")?;
    let snapshot = backends.board().snapshot(&subject).await?;
    print_json(&snapshot)
}

#[derive(Serialize)]
struct HistoryPage<'a> {
    page: usize,
    page_count: usize,
    partial: bool,
    matches: &'a [MatchSummary],
}

pub async fn history(backends: &Backends, handle: PlayerHandle, page: Option<usize>) -> Result<()> {
    let subject = handle.subject_id().context("invalid player handle")?;
    let Some(artifact) = backends.state().cached_artifact(&subject).await? else {
        println!("no cached history for {handle}");
        return Ok(());
    };
    let Some(index) = page else {
        return print_json(&artifact);
    };

    let page_size = backends.config.job.artifact_page_size;
    let matches = artifact
        .page(index, page_size)
        .with_context(|| {
            format!("page {index} out of range ({} pages)", artifact.page_count(page_size))
        })?;
    print_json(&HistoryPage {
        page: index,
        page_count: artifact.page_count(page_size),
        partial: artifact.is_partial(),
        matches,
    })
}

/// One reconciliation pass. Needs no API access.
pub async fn sweep(backends: &Backends) -> Result<()> {
    let config = &backends.config;
    let state = backends.state();
    let board = backends.board();
    let metrics = Arc::new(Metrics::new());
    let aggregator = Aggregator::new(
        state.clone(),
        board.clone(),
        config.job.clone(),
        metrics.clone(),
    );
    let reconciler = Reconciler::new(
        state,
        backends.queue.clone(),
        aggregator,
        board,
        config.reconcile.clone(),
        config.job.clone(),
        config.workers.pool_name.clone(),
        metrics,
    );
    let report = reconciler.sweep_once().await.context("reconciliation sweep failed")?;
    print_json(&report)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                if let Err(e) = ctrl_c.await {
                    warn!(error = %e, "failed to listen for ctrl_c");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(error = %e, "failed to listen for ctrl_c");
        }
    }
}
