use matchfan_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("status channel closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
