//! Redis-backed task queue.
//!
//! Ready tasks live in a list (RPUSH / LPOP); delayed tasks sit in a sorted
//! set scored by due time and are promoted by a script on every poll. LPOP
//! is polled rather than blocked on so the shared multiplexed connection
//! stays free for other callers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use matchfan_core::keys;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::warn;

use crate::consumer::{QueueHealth, TaskQueue};
use crate::error::QueueError;
use crate::task::FetchTask;

const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, body in ipairs(due) do
  redis.call('ZREM', KEYS[1], body)
  redis.call('RPUSH', KEYS[2], body)
end
return #due
"#;

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    ready_key: String,
    delayed_key: String,
}

impl RedisQueue {
    #[tracing::instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, prefix: Option<&str>, pool: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        let scope = |key: String| match prefix.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => format!("{p}:{key}"),
            None => key,
        };
        Ok(Self {
            manager,
            ready_key: scope(keys::queue_key(pool)),
            delayed_key: scope(keys::delayed_queue_key(pool)),
        })
    }

    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _moved: i64 = Script::new(PROMOTE_DUE)
            .key(&self.delayed_key)
            .key(&self.ready_key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_ready(&self) -> Result<Option<FetchTask>, QueueError> {
        let mut conn = self.manager.clone();
        let body: Option<String> = redis::cmd("LPOP")
            .arg(&self.ready_key)
            .query_async(&mut conn)
            .await?;
        match body {
            None => Ok(None),
            Some(body) => match serde_json::from_str(&body) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    // Drop the poison message; nothing can process it.
                    warn!(error = %e, "discarding undecodable task");
                    Ok(None)
                }
            },
        }
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    #[tracing::instrument(level = "debug", skip(self, task), fields(item_id = %task.item_id))]
    async fn push(&self, task: FetchTask) -> Result<(), QueueError> {
        let body = serde_json::to_string(&task)?;
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.ready_key)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, tasks), fields(count = tasks.len()))]
    async fn push_all(&self, tasks: Vec<FetchTask>) -> Result<(), QueueError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let bodies = tasks
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.ready_key)
            .arg(bodies)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, task), fields(item_id = %task.item_id))]
    async fn push_after(&self, task: FetchTask, delay: Duration) -> Result<(), QueueError> {
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let body = serde_json::to_string(&task)?;
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn poll(&self, wait: Duration) -> Result<Option<FetchTask>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.promote_due().await?;
            if let Some(task) = self.pop_ready().await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(IDLE_POLL.min(deadline - now)).await;
        }
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = redis::cmd("LLEN").arg(&self.ready_key).query_async(&mut conn).await?;
        let delayed: u64 = redis::cmd("ZCARD").arg(&self.delayed_key).query_async(&mut conn).await?;
        Ok(QueueHealth {
            connected: true,
            ready,
            delayed,
            provider: "redis".into(),
        })
    }
}
