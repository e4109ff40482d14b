//! In-process broadcast of status events.

use async_trait::async_trait;
use matchfan_core::SubjectId;
use tokio::sync::{broadcast, Mutex};
use tracing::{trace, warn};

use crate::error::StatusError;
use crate::event::StatusEvent;
use crate::traits::{StatusPublisher, StatusSubscriber};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out hub over a `tokio::sync::broadcast` channel.
///
/// Events published while nobody listens are dropped.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<StatusEvent>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Listen to every subject (`None`) or a single one.
    pub fn subscribe(&self, subject: Option<SubjectId>) -> HubSubscription {
        HubSubscription {
            rx: Mutex::new(self.tx.subscribe()),
            subject,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusPublisher for BroadcastHub {
    async fn publish(&self, event: StatusEvent) -> Result<(), StatusError> {
        // Err only means there are no receivers right now.
        match self.tx.send(event) {
            Ok(n) => trace!(listeners = n, "status event relayed"),
            Err(_) => trace!("status event dropped, no listeners"),
        }
        Ok(())
    }
}

pub struct HubSubscription {
    rx: Mutex<broadcast::Receiver<StatusEvent>>,
    subject: Option<SubjectId>,
}

#[async_trait]
impl StatusSubscriber for HubSubscription {
    async fn recv(&self) -> Result<StatusEvent, StatusError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if self.subject.as_ref().map_or(true, |s| *s == event.subject) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StatusError::Closed),
            }
        }
    }
}
