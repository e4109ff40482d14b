use std::sync::Arc;

use matchfan_core::config::StoreConfig;
use tracing::info;

use crate::consumer::TaskQueue;
use crate::error::QueueError;
use crate::memory::MemoryQueue;
use crate::redis_queue::RedisQueue;

/// Build the task queue matching the configured store backend.
pub async fn connect(config: &StoreConfig, pool: &str) -> Result<Arc<dyn TaskQueue>, QueueError> {
    if config.is_redis() {
        let queue =
            RedisQueue::connect(&config.redis_url, config.key_prefix.as_deref(), pool).await?;
        info!(pool, "task queue on redis");
        Ok(Arc::new(queue))
    } else {
        info!(pool, "task queue in memory");
        Ok(Arc::new(MemoryQueue::new()))
    }
}
