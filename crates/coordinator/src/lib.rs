//! Rate-limited fan-out/fan-in coordination of match history fetches.
//!
//! A [`Dispatcher`] enumerates a player's matches and fans out one
//! [`FetchTask`](matchfan_queue::FetchTask) per match. A [`WorkerPool`] of
//! [`FetchWorker`]s drains the queue through a shared [`RateGate`]; the
//! worker whose increment completes the job runs the [`Aggregator`]. The
//! [`Reconciler`] resumes or fails jobs that stop making progress.

pub mod aggregator;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod rate_gate;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod riot;
pub mod worker;

pub use aggregator::{AggregateOutcome, Aggregator};
pub use coordinator::Coordinator;
pub use dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use error::CoordinatorError;
pub use metrics::{Metrics, MetricsSnapshot};
pub use rate_gate::{RateGate, StoreRateGate};
pub use reconcile::{Reconciler, SweepReport};
pub use remote::{RemoteError, RemoteFetch};
pub use retry::{ErrorKind, RetryDecision, RetryPolicy};
pub use riot::RiotClient;
pub use worker::{FetchWorker, TaskOutcome, WorkerPool};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
