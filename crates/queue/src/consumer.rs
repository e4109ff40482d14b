//! Task queue trait and types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::QueueError;
use crate::task::FetchTask;

/// Health status of a queue backend.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Tasks ready for delivery.
    pub ready: u64,
    /// Tasks waiting out a retry delay.
    pub delayed: u64,
    /// Backend name ("memory", "redis").
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, ready: {}, delayed: {}, provider: {} }}",
            self.connected, self.ready, self.delayed, self.provider
        )
    }
}

/// Shared task queue feeding the worker pool.
///
/// Delivery is at-least-once: a task may be seen more than once, and the
/// consumer is expected to be idempotent per `(subject, item)`.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task for immediate delivery.
    async fn push(&self, task: FetchTask) -> Result<(), QueueError>;

    /// Enqueue many tasks. Backends may batch the write.
    async fn push_all(&self, tasks: Vec<FetchTask>) -> Result<(), QueueError> {
        for task in tasks {
            self.push(task).await?;
        }
        Ok(())
    }

    /// Enqueue a task that becomes visible after `delay`.
    async fn push_after(&self, task: FetchTask, delay: Duration) -> Result<(), QueueError>;

    /// Take the next ready task, waiting up to `wait`. `None` on timeout.
    async fn poll(&self, wait: Duration) -> Result<Option<FetchTask>, QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}

#[async_trait]
impl<T: TaskQueue + ?Sized> TaskQueue for Arc<T> {
    async fn push(&self, task: FetchTask) -> Result<(), QueueError> {
        (**self).push(task).await
    }

    async fn push_all(&self, tasks: Vec<FetchTask>) -> Result<(), QueueError> {
        (**self).push_all(tasks).await
    }

    async fn push_after(&self, task: FetchTask, delay: Duration) -> Result<(), QueueError> {
        (**self).push_after(task, delay).await
    }

    async fn poll(&self, wait: Duration) -> Result<Option<FetchTask>, QueueError> {
        (**self).poll(wait).await
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        (**self).health_check().await
    }
}
