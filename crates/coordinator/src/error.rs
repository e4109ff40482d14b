use matchfan_core::CoreError;
use matchfan_queue::QueueError;
use matchfan_status::StatusError;
use matchfan_store::StoreError;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("consistency error for {subject}: expected {expected} entries, found {found}")]
    Consistency {
        subject: String,
        expected: u64,
        found: u64,
    },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("status error: {0}")]
    Status(#[from] StatusError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
