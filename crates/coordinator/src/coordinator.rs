//! Wires every component from one [`Config`].

use std::sync::Arc;

use matchfan_core::Config;
use matchfan_queue::TaskQueue;
use matchfan_status::{StatusBoard, StatusPublisher};
use matchfan_store::{JobState, KvStore};

use crate::aggregator::Aggregator;
use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::rate_gate::{RateGate, StoreRateGate};
use crate::reconcile::Reconciler;
use crate::remote::RemoteFetch;
use crate::retry::RetryPolicy;
use crate::worker::{FetchWorker, WorkerPool};

/// All components sharing one store, queue, gate and status relay.
#[derive(Clone)]
pub struct Coordinator {
    pub config: Config,
    pub state: JobState,
    pub queue: Arc<dyn TaskQueue>,
    pub gate: Arc<dyn RateGate>,
    pub board: StatusBoard,
    pub metrics: Arc<Metrics>,
    pub dispatcher: Dispatcher,
    pub aggregator: Aggregator,
    pub worker: Arc<FetchWorker>,
    pub reconciler: Reconciler,
}

impl Coordinator {
    pub fn new(
        config: Config,
        store: Arc<dyn KvStore>,
        queue: Arc<dyn TaskQueue>,
        remote: Arc<dyn RemoteFetch>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        let state = JobState::new(store);
        let metrics = Arc::new(Metrics::new());
        let gate: Arc<dyn RateGate> =
            Arc::new(StoreRateGate::new(state.clone(), config.rate.min_interval()));
        let board = StatusBoard::new(state.clone(), publisher, config.job.cache_ttl());
        let retry = RetryPolicy::from_config(&config.fetch);

        let aggregator = Aggregator::new(
            state.clone(),
            board.clone(),
            config.job.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(
            state.clone(),
            queue.clone(),
            remote.clone(),
            gate.clone(),
            board.clone(),
            config.api.clone(),
            config.job.clone(),
            retry,
            metrics.clone(),
        );
        let worker = Arc::new(FetchWorker::new(
            state.clone(),
            queue.clone(),
            remote,
            gate.clone(),
            board.clone(),
            aggregator.clone(),
            retry,
            config.fetch.timeout(),
            config.job.clone(),
            config.rate.clone(),
            metrics.clone(),
        ));
        let reconciler = Reconciler::new(
            state.clone(),
            queue.clone(),
            aggregator.clone(),
            board.clone(),
            config.reconcile.clone(),
            config.job.clone(),
            config.workers.pool_name.clone(),
            metrics.clone(),
        );

        Self {
            config,
            state,
            queue,
            gate,
            board,
            metrics,
            dispatcher,
            aggregator,
            worker,
            reconciler,
        }
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.worker.clone(),
            self.queue.clone(),
            self.state.clone(),
            self.config.workers.clone(),
        )
    }
}
