//! Redis-backed `KvStore`.
//!
//! Keys are namespaced by an optional prefix so several deployments can
//! share one Redis. Compound operations run as Lua scripts so each trait
//! method remains a single atomic round trip.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::StoreError;
use crate::traits::{CountedInsert, GuardedCounter, KvStore};

// KEYS: hash, counter hash. ARGV: field, value, counter field, guard field, guard value.
// -1: rejected, -2: field already present, otherwise the new count.
const HSETNX_COUNTED: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[4]) ~= ARGV[5] then
  return -1
end
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return -2
end
return redis.call('HINCRBY', KEYS[2], ARGV[3], 1)
"#;

// KEYS: counter hash, counted hash. ARGV: counter field, guard field, guard value, pairs...
const RECOUNT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[2]) ~= ARGV[3] then
  return false
end
local n = redis.call('HLEN', KEYS[2])
redis.call('HSET', KEYS[1], ARGV[1], n)
if #ARGV > 3 then
  redis.call('HSET', KEYS[1], unpack(ARGV, 4))
end
return n
"#;

const HSET_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

const RESERVE_SLOT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local now = tonumber(ARGV[1])
local start = current
if now > start then
  start = now
end
redis.call('SET', KEYS[1], tostring(start + tonumber(ARGV[2])))
return start
"#;

const RAISE_SLOT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local wanted = tonumber(ARGV[1])
if wanted > current then
  current = wanted
  redis.call('SET', KEYS[1], tostring(current))
end
return current
"#;

const SCAN_BATCH: usize = 500;

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    prefix: Option<String>,
}

impl RedisStore {
    #[tracing::instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, prefix: Option<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        let prefix = prefix.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        Ok(Self { manager, prefix })
    }

    fn scoped(&self, key: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{key}"),
            None => key.to_string(),
        }
    }

    fn unscoped(&self, key: String) -> String {
        match &self.prefix {
            Some(p) => key
                .strip_prefix(p.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::to_string)
                .unwrap_or(key),
            None => key,
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let value: Option<String> =
            redis::cmd("GET").arg(self.scoped(key)).query_async(&mut conn).await?;
        Ok(value)
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.scoped(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.scoped(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let scoped: Vec<String> = keys.iter().map(|k| self.scoped(k)).collect();
        let n: i64 = redis::cmd("DEL").arg(scoped).query_async(&mut conn).await?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let n: i64 =
            redis::cmd("EXISTS").arg(self.scoped(key)).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.manager.clone();
        let ms: i64 =
            redis::cmd("PTTL").arg(self.scoped(key)).query_async(&mut conn).await?;
        // -2: missing, -1: no expiry.
        if ms < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(ms as u64)))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let n: i64 = redis::cmd("PEXPIRE")
            .arg(self.scoped(key))
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(n == 1)
    }

    #[tracing::instrument(level = "debug", skip(self, fields))]
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.scoped(key));
        for (field, value) in fields {
            cmd.arg(*field).arg(value.as_str());
        }
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, fields))]
    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<bool, StoreError> {
        if fields.is_empty() {
            return self.exists(key).await;
        }
        let mut conn = self.manager.clone();
        let script = Script::new(HSET_EXISTING);
        let mut invocation = script.key(self.scoped(key));
        for (field, value) in fields {
            invocation.arg(*field).arg(value.as_str());
        }
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let n: i64 = redis::cmd("HEXISTS")
            .arg(self.scoped(key))
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(n == 1)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.manager.clone();
        let all: HashMap<String, String> =
            redis::cmd("HGETALL").arg(self.scoped(key)).query_async(&mut conn).await?;
        Ok(all)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let n: i64 = redis::cmd("HDEL")
            .arg(self.scoped(key))
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn hset_nx_counted(
        &self,
        key: &str,
        field: &str,
        value: &str,
        counter: GuardedCounter<'_>,
    ) -> Result<CountedInsert, StoreError> {
        let mut conn = self.manager.clone();
        let reply: i64 = Script::new(HSETNX_COUNTED)
            .key(self.scoped(key))
            .key(self.scoped(counter.key))
            .arg(field)
            .arg(value)
            .arg(counter.field)
            .arg(counter.guard_field)
            .arg(counter.guard_value)
            .invoke_async(&mut conn)
            .await?;
        Ok(match reply {
            -1 => CountedInsert::Rejected,
            -2 => CountedInsert::Exists,
            n => CountedInsert::Counted(n),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, fields))]
    async fn recount(
        &self,
        counter: GuardedCounter<'_>,
        counted_key: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.manager.clone();
        let script = Script::new(RECOUNT);
        let mut invocation = script.key(self.scoped(counter.key));
        invocation
            .key(self.scoped(counted_key))
            .arg(counter.field)
            .arg(counter.guard_field)
            .arg(counter.guard_value);
        for (field, value) in fields {
            invocation.arg(*field).arg(value.as_str());
        }
        let count: Option<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(count)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let pattern = self.scoped(pattern);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch.into_iter().map(|k| self.unscoped(k)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reserve_slot(&self, key: &str, now_ms: i64, step_ms: i64) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let start: i64 = Script::new(RESERVE_SLOT)
            .key(self.scoped(key))
            .arg(now_ms)
            .arg(step_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(start)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn raise_slot(&self, key: &str, at_least_ms: i64) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let value: i64 = Script::new(RAISE_SLOT)
            .key(self.scoped(key))
            .arg(at_least_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }
}
