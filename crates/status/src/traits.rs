use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StatusError;
use crate::event::StatusEvent;

/// Relays status events to whoever is listening.
///
/// Publishing never blocks on listeners and succeeds when there are none.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, event: StatusEvent) -> Result<(), StatusError>;
}

/// Blanket implementation so `Arc<dyn StatusPublisher>` can be used directly.
#[async_trait]
impl<T: StatusPublisher + ?Sized> StatusPublisher for Arc<T> {
    async fn publish(&self, event: StatusEvent) -> Result<(), StatusError> {
        (**self).publish(event).await
    }
}

/// Receives status events, optionally filtered to one subject.
#[async_trait]
pub trait StatusSubscriber: Send + Sync {
    /// Next matching event. Blocks until one arrives.
    async fn recv(&self) -> Result<StatusEvent, StatusError>;
}
