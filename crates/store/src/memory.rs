//! In-process `KvStore` backend.
//!
//! Used by tests and by single-process deployments. All operations take
//! one mutex, so each is atomic with respect to every other.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::traits::{glob_match, CountedInsert, GuardedCounter, KvStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| StoreError::Other("memory store mutex poisoned".into()))?;
        let now = Instant::now();
        map.retain(|_, entry| entry.live(now));
        Ok(map)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::corrupt(key, "operation against a key holding the wrong kind of value")
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// Current counter value, or `None` when the hash is gone or the guard
/// field no longer holds the expected value.
fn guarded_count(
    map: &HashMap<String, Entry>,
    counter: &GuardedCounter<'_>,
) -> Result<Option<i64>, StoreError> {
    match map.get(counter.key) {
        None => Ok(None),
        Some(Entry { value: Value::Hash(h), .. }) => {
            if h.get(counter.guard_field).map(String::as_str) != Some(counter.guard_value) {
                return Ok(None);
            }
            match h.get(counter.field) {
                Some(raw) => parse_slot(counter.key, raw).map(Some),
                None => Ok(Some(0)),
            }
        }
        Some(_) => Err(wrong_type(counter.key)),
    }
}

/// Write fields into a hash already known to exist.
fn set_hash_fields(map: &mut HashMap<String, Entry>, key: &str, fields: &[(&str, String)]) {
    if let Some(Entry { value: Value::Hash(h), .. }) = map.get_mut(key) {
        for (field, value) in fields {
            h.insert((*field).to_string(), value.clone());
        }
    }
}

fn parse_slot(key: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse::<i64>()
        .map_err(|e| StoreError::corrupt(key, format!("not an integer: {e}")))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let map = self.lock()?;
        match map.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut map = self.lock()?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut map = self.lock()?;
        Ok(keys.iter().filter(|k| map.remove(k.as_str()).is_some()).count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let map = self.lock()?;
        let now = Instant::now();
        Ok(map
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut map = self.lock()?;
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => {
                for (field, value) in fields {
                    h.insert((*field).to_string(), value.clone());
                }
                Ok(())
            }
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<bool, StoreError> {
        let mut map = self.lock()?;
        match map.get_mut(key) {
            None => Ok(false),
            Some(Entry { value: Value::Hash(h), .. }) => {
                for (field, value) in fields {
                    h.insert((*field).to_string(), value.clone());
                }
                Ok(true)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let map = self.lock()?;
        match map.get(key) {
            None => Ok(false),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.contains_key(field)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let map = self.lock()?;
        match map.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        let mut map = self.lock()?;
        let removed = match map.get_mut(key) {
            None => 0,
            Some(Entry { value: Value::Hash(h), .. }) => {
                fields.iter().filter(|f| h.remove(f.as_str()).is_some()).count() as u64
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if matches!(map.get(key), Some(Entry { value: Value::Hash(h), .. }) if h.is_empty()) {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn hset_nx_counted(
        &self,
        key: &str,
        field: &str,
        value: &str,
        counter: GuardedCounter<'_>,
    ) -> Result<CountedInsert, StoreError> {
        let mut map = self.lock()?;
        let current = match guarded_count(&map, &counter)? {
            Some(current) => current,
            None => return Ok(CountedInsert::Rejected),
        };

        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) if h.contains_key(field) => return Ok(CountedInsert::Exists),
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
            }
            Value::Str(_) => return Err(wrong_type(key)),
        }

        let next = current + 1;
        set_hash_fields(&mut map, counter.key, &[(counter.field, next.to_string())]);
        Ok(CountedInsert::Counted(next))
    }

    async fn recount(
        &self,
        counter: GuardedCounter<'_>,
        counted_key: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<i64>, StoreError> {
        let mut map = self.lock()?;
        if guarded_count(&map, &counter)?.is_none() {
            return Ok(None);
        }
        let count = match map.get(counted_key) {
            None => 0,
            Some(Entry { value: Value::Hash(h), .. }) => h.len() as i64,
            Some(_) => return Err(wrong_type(counted_key)),
        };
        set_hash_fields(&mut map, counter.key, &[(counter.field, count.to_string())]);
        set_hash_fields(&mut map, counter.key, fields);
        Ok(Some(count))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let map = self.lock()?;
        let mut keys: Vec<String> =
            map.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn reserve_slot(&self, key: &str, now_ms: i64, step_ms: i64) -> Result<i64, StoreError> {
        let mut map = self.lock()?;
        let current = match map.get(key) {
            None => 0,
            Some(Entry { value: Value::Str(s), .. }) => parse_slot(key, s)?,
            Some(_) => return Err(wrong_type(key)),
        };
        let start = current.max(now_ms);
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str((start + step_ms).to_string()),
                expires_at: None,
            },
        );
        Ok(start)
    }

    async fn raise_slot(&self, key: &str, at_least_ms: i64) -> Result<i64, StoreError> {
        let mut map = self.lock()?;
        let current = match map.get(key) {
            None => 0,
            Some(Entry { value: Value::Str(s), .. }) => parse_slot(key, s)?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current.max(at_least_ms);
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at: None,
            },
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_nx_only_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock:a", "1", Some(Duration::from_secs(5))).await.unwrap());
        assert!(!store.set_nx("lock:a", "2", None).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn expired_keys_disappear() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_nx("k", "again", None).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_reports_remaining_lifetime() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(60))).await.unwrap();
        let ttl = store.ttl("k").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(50));
        store.set("forever", "v", None).await.unwrap();
        assert!(store.ttl("forever").await.unwrap().is_none());
        assert!(store.ttl("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hset_existing_never_recreates_a_deleted_hash() {
        let store = MemoryStore::new();
        assert!(!store.hset_existing("agg", &[("touched", "1".into())]).await.unwrap());
        assert!(!store.exists("agg").await.unwrap());

        store.hset("agg", &[("total", "2".into())]).await.unwrap();
        assert!(store.hset_existing("agg", &[("touched", "1".into())]).await.unwrap());
        assert_eq!(store.hget_all("agg").await.unwrap().len(), 2);
    }

    fn counter(generation: &str) -> GuardedCounter<'_> {
        GuardedCounter {
            key: "agg",
            field: "processed",
            guard_field: "job_id",
            guard_value: generation,
        }
    }

    #[tokio::test]
    async fn counted_insert_deduplicates_and_counts() {
        let store = MemoryStore::new();
        store
            .hset("agg", &[("processed", "0".into()), ("job_id", "g1".into())])
            .await
            .unwrap();

        let first = store.hset_nx_counted("results", "m1", "a", counter("g1")).await.unwrap();
        assert_eq!(first, CountedInsert::Counted(1));
        let again = store.hset_nx_counted("results", "m1", "b", counter("g1")).await.unwrap();
        assert_eq!(again, CountedInsert::Exists);

        assert!(store.hexists("results", "m1").await.unwrap());
        assert!(!store.hexists("results", "m2").await.unwrap());
        let all = store.hget_all("results").await.unwrap();
        assert_eq!(all.get("m1").map(String::as_str), Some("a"));
        assert_eq!(store.hget_all("agg").await.unwrap()["processed"], "1");
    }

    #[tokio::test]
    async fn counted_insert_rejected_without_matching_counter() {
        let store = MemoryStore::new();
        let gone = store.hset_nx_counted("results", "m1", "a", counter("g1")).await.unwrap();
        assert_eq!(gone, CountedInsert::Rejected);
        assert!(!store.exists("results").await.unwrap());
        assert!(!store.exists("agg").await.unwrap());

        store
            .hset("agg", &[("processed", "0".into()), ("job_id", "g2".into())])
            .await
            .unwrap();
        let stale = store.hset_nx_counted("results", "m1", "a", counter("g1")).await.unwrap();
        assert_eq!(stale, CountedInsert::Rejected);
        assert!(!store.exists("results").await.unwrap());
        assert_eq!(store.hget_all("agg").await.unwrap()["processed"], "0");
    }

    #[tokio::test]
    async fn recount_matches_counted_hash() {
        let store = MemoryStore::new();
        assert_eq!(store.recount(counter("g1"), "results", &[]).await.unwrap(), None);

        store
            .hset("agg", &[("processed", "7".into()), ("job_id", "g1".into())])
            .await
            .unwrap();
        store
            .hset("results", &[("m1", "a".into()), ("m2", "b".into())])
            .await
            .unwrap();
        let count = store
            .recount(counter("g1"), "results", &[("resumes", "1".into())])
            .await
            .unwrap();
        assert_eq!(count, Some(2));
        let agg = store.hget_all("agg").await.unwrap();
        assert_eq!(agg["processed"], "2");
        assert_eq!(agg["resumes"], "1");
    }

    #[tokio::test]
    async fn concurrent_counted_inserts_return_distinct_values() {
        let store = Arc::new(MemoryStore::new());
        store
            .hset("agg", &[("processed", "0".into()), ("job_id", "g1".into())])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let field = format!("m{}", i % 25);
                store.hset_nx_counted("results", &field, "x", counter("g1")).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            if let CountedInsert::Counted(n) = h.await.unwrap() {
                seen.push(n);
            }
        }
        seen.sort();
        assert_eq!(seen, (1..=25).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn reserve_slot_spaces_callers() {
        let store = MemoryStore::new();
        assert_eq!(store.reserve_slot("rate:next", 1_000, 100).await.unwrap(), 1_000);
        assert_eq!(store.reserve_slot("rate:next", 1_000, 100).await.unwrap(), 1_100);
        // Idle gap: the slot snaps forward to now.
        assert_eq!(store.reserve_slot("rate:next", 5_000, 100).await.unwrap(), 5_000);

        assert_eq!(store.raise_slot("rate:next", 9_000).await.unwrap(), 9_000);
        assert_eq!(store.raise_slot("rate:next", 1).await.unwrap(), 9_000);
        assert_eq!(store.reserve_slot("rate:next", 5_200, 100).await.unwrap(), 9_000);
    }

    #[tokio::test]
    async fn scan_and_delete() {
        let store = MemoryStore::new();
        store.hset("job:a:agg", &[("total", "1".into())]).await.unwrap();
        store.hset("job:b:agg", &[("total", "1".into())]).await.unwrap();
        store.set("cache:a", "{}", None).await.unwrap();

        let keys = store.scan("job:*:agg").await.unwrap();
        assert_eq!(keys, vec!["job:a:agg".to_string(), "job:b:agg".to_string()]);

        let removed = store
            .del(&["job:a:agg".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(matches!(store.hget_all("k").await, Err(StoreError::Corrupt { .. })));
    }
}
