//! Key/value primitives the coordination layer is built on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Shared, crash-durable key/value storage.
///
/// Every method is a single atomic operation against the backend. Callers
/// never hold anything across two calls; multi-step invariants are kept by
/// the ordering of these primitives in [`JobState`](crate::JobState).
/// A counter field in a hash that is only touched while another field of
/// the same hash still holds an expected value.
#[derive(Debug, Clone, Copy)]
pub struct GuardedCounter<'a> {
    pub key: &'a str,
    pub field: &'a str,
    pub guard_field: &'a str,
    pub guard_value: &'a str,
}

/// Result of [`KvStore::hset_nx_counted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountedInsert {
    /// The field was new; the counter now holds this value.
    Counted(i64),
    /// The field was already present. Nothing changed.
    Exists,
    /// The counter hash is missing or its guard no longer matches.
    Rejected,
}

/// Shared, crash-durable key/value storage.
///
/// Every method is a single atomic operation against the backend. Callers
/// never hold anything across two calls; multi-step invariants are kept by
/// the ordering of these primitives in [`JobState`](crate::JobState).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key`, optionally with an expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set only if absent. Returns `true` when this call created the key.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining lifetime. `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Reset the expiry of an existing key. Returns `false` if it is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// Write hash fields only if the hash already exists. Returns `false`
    /// (and writes nothing) when it is missing.
    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<bool, StoreError>;

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError>;

    /// Insert a hash field if absent and, in the same step, increment
    /// `counter`. Nothing is written when the counter is rejected, so a
    /// finished job is never recreated and a newer job is never charged.
    async fn hset_nx_counted(
        &self,
        key: &str,
        field: &str,
        value: &str,
        counter: GuardedCounter<'_>,
    ) -> Result<CountedInsert, StoreError>;

    /// Set `counter` to the number of fields in `counted_key` and write
    /// `fields` alongside it. `None` when the counter is rejected.
    async fn recount(
        &self,
        counter: GuardedCounter<'_>,
        counted_key: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<i64>, StoreError>;

    /// Keys matching a glob pattern (`*` wildcards only).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Reserve the next slot on a shared timeline.
    ///
    /// Atomically reads the stored value `v` (0 when absent), returns
    /// `start = max(v, now_ms)` and stores `start + step_ms`.
    async fn reserve_slot(&self, key: &str, now_ms: i64, step_ms: i64) -> Result<i64, StoreError>;

    /// Raise a slot to at least `at_least_ms`, returning the stored value.
    async fn raise_slot(&self, key: &str, at_least_ms: i64) -> Result<i64, StoreError>;
}

/// Blanket implementation so `Arc<dyn KvStore>` can be used directly.
#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        (**self).set_nx(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        (**self).del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        (**self).ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).expire(key, ttl).await
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        (**self).hset(key, fields).await
    }

    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<bool, StoreError> {
        (**self).hset_existing(key, fields).await
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        (**self).hexists(key, field).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        (**self).hget_all(key).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        (**self).hdel(key, fields).await
    }

    async fn hset_nx_counted(
        &self,
        key: &str,
        field: &str,
        value: &str,
        counter: GuardedCounter<'_>,
    ) -> Result<CountedInsert, StoreError> {
        (**self).hset_nx_counted(key, field, value, counter).await
    }

    async fn recount(
        &self,
        counter: GuardedCounter<'_>,
        counted_key: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<i64>, StoreError> {
        (**self).recount(counter, counted_key, fields).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        (**self).scan(pattern).await
    }

    async fn reserve_slot(&self, key: &str, now_ms: i64, step_ms: i64) -> Result<i64, StoreError> {
        (**self).reserve_slot(key, now_ms, step_ms).await
    }

    async fn raise_slot(&self, key: &str, at_least_ms: i64) -> Result<i64, StoreError> {
        (**self).raise_slot(key, at_least_ms).await
    }
}

/// Match `key` against a glob where `*` matches any run of characters.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &key[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn glob_matches_job_aggregates() {
        assert!(glob_match("job:*:agg", "job:faker#kr1@kr:agg"));
        assert!(!glob_match("job:*:agg", "job:faker#kr1@kr:results"));
        assert!(!glob_match("job:*:agg", "cache:faker"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn glob_does_not_overlap_prefix_and_suffix() {
        assert!(!glob_match("ab*ba", "aba"));
        assert!(glob_match("ab*ba", "abba"));
    }
}
