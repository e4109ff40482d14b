use std::sync::Arc;

use matchfan_core::config::StoreConfig;
use tracing::info;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::redis_store::RedisStore;
use crate::traits::KvStore;

/// Build the store selected by `STORE_BACKEND`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "memory" | "" => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        "redis" => {
            let store = RedisStore::connect(&config.redis_url, config.key_prefix.clone()).await?;
            info!(prefix = ?config.key_prefix, "connected to redis store");
            Ok(Arc::new(store))
        }
        other => Err(StoreError::NotConfigured(format!(
            "unknown store backend '{other}' (expected 'memory' or 'redis')"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_is_default() {
        let store = connect(&StoreConfig::default()).await.unwrap();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let config = StoreConfig {
            backend: "etcd".into(),
            ..StoreConfig::default()
        };
        assert!(matches!(connect(&config).await, Err(StoreError::NotConfigured(_))));
    }
}
