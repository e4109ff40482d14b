//! Status relay plus the sticky record pollers read.

use std::sync::Arc;
use std::time::Duration;

use matchfan_core::SubjectId;
use matchfan_store::JobState;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StatusError;
use crate::event::{JobStatus, StatusEvent};
use crate::traits::StatusPublisher;

/// What a poller sees for a subject right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatusSnapshot {
    Cooldown { remaining_secs: u64 },
    Fetching { processed: u64, total: u64 },
    /// Lock held but job state not written yet.
    Starting,
    Terminal { status: JobStatus },
    Ready { matches: usize, partial: bool },
    Idle,
}

/// Publishes status events and keeps terminal ones in the store.
#[derive(Clone)]
pub struct StatusBoard {
    state: JobState,
    publisher: Arc<dyn StatusPublisher>,
    sticky_ttl: Duration,
}

impl StatusBoard {
    pub fn new(state: JobState, publisher: Arc<dyn StatusPublisher>, sticky_ttl: Duration) -> Self {
        Self {
            state,
            publisher,
            sticky_ttl,
        }
    }

    /// Relay a status change. Terminal statuses are also recorded.
    ///
    /// A failed store write is logged; the relay still happens.
    pub async fn publish(&self, subject: &SubjectId, status: JobStatus) -> Result<(), StatusError> {
        let event = StatusEvent::new(subject.clone(), status);
        if event.status.is_terminal() {
            let raw = serde_json::to_string(&event.status)?;
            if let Err(e) = self.state.record_status(subject, &raw, self.sticky_ttl).await {
                warn!(subject = %subject, error = %e, "failed to record terminal status");
            }
        }
        debug!(subject = %subject, status = event.status.name(), "status");
        self.publisher.publish(event).await
    }

    /// Forget the sticky status when a new dispatch begins.
    pub async fn begin(&self, subject: &SubjectId) -> Result<(), StatusError> {
        self.state.clear_status(subject).await?;
        Ok(())
    }

    /// The last recorded terminal status, if any.
    pub async fn last_terminal(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<JobStatus>, StatusError> {
        let Some(raw) = self.state.last_status(subject).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                warn!(subject = %subject, error = %e, "ignoring undecodable sticky status");
                Ok(None)
            }
        }
    }

    /// Resolve the poll view: cooldown, live progress, starting, sticky
    /// failure, cached data, sticky completion, then idle.
    pub async fn snapshot(&self, subject: &SubjectId) -> Result<StatusSnapshot, StatusError> {
        if let Some(remaining) = self.state.cooldown_remaining(subject).await? {
            return Ok(StatusSnapshot::Cooldown {
                remaining_secs: remaining.as_secs().max(1),
            });
        }

        if let Some(agg) = self.state.load_job(subject).await? {
            return Ok(StatusSnapshot::Fetching {
                processed: agg.processed,
                total: agg.total,
            });
        }

        if self.state.lock_held(subject).await? {
            return Ok(StatusSnapshot::Starting);
        }

        let terminal = self.last_terminal(subject).await?;
        if let Some(status) = terminal.as_ref().filter(|s| **s != JobStatus::Completed) {
            return Ok(StatusSnapshot::Terminal { status: status.clone() });
        }

        if let Some(artifact) = self.state.cached_artifact(subject).await? {
            return Ok(StatusSnapshot::Ready {
                matches: artifact.len(),
                partial: artifact.is_partial(),
            });
        }

        Ok(match terminal {
            Some(status) => StatusSnapshot::Terminal { status },
            None => StatusSnapshot::Idle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BroadcastHub;
    use crate::traits::StatusSubscriber;
    use matchfan_core::JobAggregate;
    use matchfan_store::MemoryStore;

    fn board() -> (StatusBoard, JobState, BroadcastHub) {
        let state = JobState::new(Arc::new(MemoryStore::new()));
        let hub = BroadcastHub::new();
        let board = StatusBoard::new(state.clone(), Arc::new(hub.clone()), Duration::from_secs(60));
        (board, state, hub)
    }

    fn subject() -> SubjectId {
        SubjectId::from_raw("a#b@euw")
    }

    #[tokio::test]
    async fn terminal_status_is_sticky_until_begin() {
        let (board, _, _) = board();
        board.publish(&subject(), JobStatus::NoMatches).await.unwrap();
        assert_eq!(
            board.snapshot(&subject()).await.unwrap(),
            StatusSnapshot::Terminal { status: JobStatus::NoMatches }
        );

        board.begin(&subject()).await.unwrap();
        assert_eq!(board.snapshot(&subject()).await.unwrap(), StatusSnapshot::Idle);
    }

    #[tokio::test]
    async fn progress_is_relayed_but_not_recorded() {
        let (board, state, hub) = board();
        let sub = hub.subscribe(Some(subject()));
        board
            .publish(&subject(), JobStatus::Progress { processed: 1, total: 3 })
            .await
            .unwrap();
        assert_eq!(
            sub.recv().await.unwrap().status,
            JobStatus::Progress { processed: 1, total: 3 }
        );
        assert!(state.last_status(&subject()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_precedence() {
        let (board, state, _) = board();
        assert_eq!(board.snapshot(&subject()).await.unwrap(), StatusSnapshot::Idle);

        state
            .try_acquire_lock(&subject(), "t", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(board.snapshot(&subject()).await.unwrap(), StatusSnapshot::Starting);

        let agg = JobAggregate::new(subject(), "euw", "p", 4);
        state.create_job(&agg, &[]).await.unwrap();
        assert_eq!(
            board.snapshot(&subject()).await.unwrap(),
            StatusSnapshot::Fetching { processed: 0, total: 4 }
        );

        state.set_cooldown(&subject(), Duration::from_secs(30)).await.unwrap();
        assert!(matches!(
            board.snapshot(&subject()).await.unwrap(),
            StatusSnapshot::Cooldown { .. }
        ));
    }
}
