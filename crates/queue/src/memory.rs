//! In-process task queue.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::consumer::{QueueHealth, TaskQueue};
use crate::error::QueueError;
use crate::task::FetchTask;

#[derive(Default)]
struct Inner {
    ready: VecDeque<FetchTask>,
    /// Delayed tasks with their due time, unordered.
    delayed: Vec<(Instant, FetchTask)>,
}

impl Inner {
    /// Move every due delayed task onto the ready list.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, task) = self.delayed.swap_remove(i);
                self.ready.push_back(task);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// FIFO queue with delayed delivery, shared by workers in one process.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Provider("memory queue mutex poisoned".into()))
    }

    /// Ready plus delayed tasks.
    pub fn len(&self) -> usize {
        self.lock().map(|q| q.ready.len() + q.delayed.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task: FetchTask) -> Result<(), QueueError> {
        self.lock()?.ready.push_back(task);
        self.notify.notify_one();
        Ok(())
    }

    async fn push_all(&self, tasks: Vec<FetchTask>) -> Result<(), QueueError> {
        let count = tasks.len();
        self.lock()?.ready.extend(tasks);
        for _ in 0..count {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn push_after(&self, task: FetchTask, delay: Duration) -> Result<(), QueueError> {
        self.lock()?.delayed.push((Instant::now() + delay, task));
        // Wake a poller so it recomputes its deadline.
        self.notify.notify_one();
        Ok(())
    }

    async fn poll(&self, wait: Duration) -> Result<Option<FetchTask>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let wake_at = {
                let mut inner = self.lock()?;
                let now = Instant::now();
                inner.promote(now);
                if let Some(task) = inner.ready.pop_front() {
                    return Ok(Some(task));
                }
                if now >= deadline {
                    return Ok(None);
                }
                inner.next_due().map_or(deadline, |due| due.min(deadline))
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let inner = self.lock()?;
        Ok(QueueHealth {
            connected: true,
            ready: inner.ready.len() as u64,
            delayed: inner.delayed.len() as u64,
            provider: "memory".into(),
        })
    }
}
