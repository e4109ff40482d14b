//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("queue closed")]
    Closed,

    #[error("provider error: {0}")]
    Provider(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Parse(e.to_string())
    }
}
