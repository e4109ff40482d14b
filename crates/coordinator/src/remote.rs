//! The remote API seam and its error classification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use matchfan_core::{ItemId, MatchSummary, PlayerHandle};
use thiserror::Error;

use crate::retry::ErrorKind;

/// Outcome classes of one outbound call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The requested identity or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server asked us to back off.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, connection failures and 5xx responses.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Anything retrying cannot fix.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::RateLimited { .. } => ErrorKind::Throttled,
            RemoteError::Transient(_) => ErrorKind::Transient,
            RemoteError::NotFound(_) | RemoteError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// One call per method; callers pass through the rate gate first.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    /// Resolve a handle to the stable player id (puuid).
    async fn resolve_identity(&self, handle: &PlayerHandle) -> Result<String, RemoteError>;

    /// One page of item ids, newest first.
    async fn list_item_ids(
        &self,
        region: &str,
        player_ref: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<ItemId>, RemoteError>;

    /// Fetch one item and extract the player's summary from it.
    async fn fetch_item(
        &self,
        region: &str,
        item_id: &str,
        player_ref: &str,
    ) -> Result<MatchSummary, RemoteError>;
}

#[async_trait]
impl<T: RemoteFetch + ?Sized> RemoteFetch for Arc<T> {
    async fn resolve_identity(&self, handle: &PlayerHandle) -> Result<String, RemoteError> {
        (**self).resolve_identity(handle).await
    }

    async fn list_item_ids(
        &self,
        region: &str,
        player_ref: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<ItemId>, RemoteError> {
        (**self).list_item_ids(region, player_ref, start, count).await
    }

    async fn fetch_item(
        &self,
        region: &str,
        item_id: &str,
        player_ref: &str,
    ) -> Result<MatchSummary, RemoteError> {
        (**self).fetch_item(region, item_id, player_ref).await
    }
}
