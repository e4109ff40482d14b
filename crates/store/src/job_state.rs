//! Typed access to every coordination key a job touches.
//!
//! `JobState` is the only place that knows how aggregates, manifests,
//! partial results and markers are laid out in the key/value store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use matchfan_core::keys;
use matchfan_core::{CachedArtifact, ItemId, JobAggregate, PartialEntry, SubjectId};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::traits::{CountedInsert, GuardedCounter, KvStore};

const F_SUBJECT: &str = "subject_id";
const F_JOB_ID: &str = "job_id";
const F_REGION: &str = "region";
const F_PLAYER: &str = "player_ref";
const F_TOTAL: &str = "total";
const F_PROCESSED: &str = "processed";
const F_RESUMES: &str = "resumes";
const F_CREATED: &str = "created_at";
const F_UPDATED: &str = "last_update_at";

/// Outcome of recording one item against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First entry for the item; `processed` now holds this value.
    Counted(u64),
    /// The item was already recorded. Nothing changed.
    Duplicate,
    /// The job finished or was replaced. Nothing was written.
    JobGone,
}

#[derive(Clone)]
pub struct JobState {
    store: Arc<dyn KvStore>,
}

impl JobState {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    // ── Cached artifact / cooldown ────────────────────────────

    /// The cached artifact, if present and not past its `expires_at`.
    pub async fn cached_artifact(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<CachedArtifact>, StoreError> {
        let key = keys::cache_key(subject);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let artifact: CachedArtifact =
            serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(&key, e.to_string()))?;
        if artifact.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(artifact))
    }

    pub async fn write_artifact(
        &self,
        artifact: &CachedArtifact,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(artifact)?;
        self.store
            .set(&keys::cache_key(&artifact.subject_id), &raw, Some(ttl))
            .await
    }

    /// Time left on the subject's cooldown, `None` when not cooling down.
    pub async fn cooldown_remaining(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<Duration>, StoreError> {
        let remaining = self.store.ttl(&keys::cooldown_key(subject)).await?;
        Ok(remaining.filter(|d| !d.is_zero()))
    }

    pub async fn set_cooldown(&self, subject: &SubjectId, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.store
            .set(&keys::cooldown_key(subject), &expires_at.to_rfc3339(), Some(ttl))
            .await
    }

    // ── Dispatch lock ─────────────────────────────────────────

    /// Atomic check-and-acquire. Returns `false` when another dispatch holds it.
    pub async fn try_acquire_lock(
        &self,
        subject: &SubjectId,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store.set_nx(&keys::lock_key(subject), token, Some(ttl)).await
    }

    pub async fn extend_lock(
        &self,
        subject: &SubjectId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store.expire(&keys::lock_key(subject), ttl).await
    }

    pub async fn release_lock(&self, subject: &SubjectId) -> Result<(), StoreError> {
        self.store.del(&[keys::lock_key(subject)]).await?;
        Ok(())
    }

    pub async fn lock_held(&self, subject: &SubjectId) -> Result<bool, StoreError> {
        self.store.exists(&keys::lock_key(subject)).await
    }

    // ── Job aggregate / manifest ──────────────────────────────

    /// Create job state for a fresh dispatch.
    ///
    /// Leftovers from an earlier job are cleared first, and the manifest
    /// is written before the aggregate so anything that can see the
    /// aggregate can also see the manifest.
    pub async fn create_job(&self, agg: &JobAggregate, items: &[ItemId]) -> Result<(), StoreError> {
        let subject = &agg.subject_id;
        self.store
            .del(&[
                keys::agg_key(subject),
                keys::results_key(subject),
                keys::finalize_key(subject),
            ])
            .await?;
        let manifest = serde_json::to_string(items)?;
        self.store.set(&keys::items_key(subject), &manifest, None).await?;
        self.store.hset(&keys::agg_key(subject), &agg_fields(agg)).await?;
        debug!(subject = %subject, total = agg.total, "job state created");
        Ok(())
    }

    pub async fn load_job(&self, subject: &SubjectId) -> Result<Option<JobAggregate>, StoreError> {
        let key = keys::agg_key(subject);
        let fields = self.store.hget_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_agg(&key, subject, &fields).map(Some)
    }

    pub async fn job_exists(&self, subject: &SubjectId) -> Result<bool, StoreError> {
        self.store.exists(&keys::agg_key(subject)).await
    }

    /// The item manifest written at dispatch.
    pub async fn job_items(&self, subject: &SubjectId) -> Result<Option<Vec<ItemId>>, StoreError> {
        let key = keys::items_key(subject);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let items = serde_json::from_str(&raw)
            .map_err(|e| StoreError::corrupt(&key, e.to_string()))?;
        Ok(Some(items))
    }

    /// Subjects with a live aggregate.
    pub async fn list_jobs(&self) -> Result<Vec<SubjectId>, StoreError> {
        let found = self.store.scan(keys::AGG_SCAN_PATTERN).await?;
        Ok(found.iter().filter_map(|k| keys::subject_from_agg_key(k)).collect())
    }

    /// Refresh `last_update_at`. Returns `false` if the job is gone.
    pub async fn touch_job(&self, subject: &SubjectId) -> Result<bool, StoreError> {
        self.store
            .hset_existing(&keys::agg_key(subject), &[(F_UPDATED, Utc::now().to_rfc3339())])
            .await
    }

    /// Reset `processed` to the number of recorded entries, in one store
    /// step so concurrent recorders cannot skew it. `None` when the job
    /// is gone or belongs to another generation.
    pub async fn recount_progress(
        &self,
        agg: &JobAggregate,
        resumes: u32,
    ) -> Result<Option<u64>, StoreError> {
        let subject = &agg.subject_id;
        let agg_key = keys::agg_key(subject);
        let count = self
            .store
            .recount(
                progress_counter(&agg_key, &agg.job_id),
                &keys::results_key(subject),
                &[(F_RESUMES, resumes.to_string()), (F_UPDATED, Utc::now().to_rfc3339())],
            )
            .await?;
        Ok(count.map(|n| n.max(0) as u64))
    }

    // ── Partial results ───────────────────────────────────────

    /// Record an item's outcome and advance `processed` in one step.
    ///
    /// Only the first entry for an item counts; later deliveries leave it in
    /// place. Nothing is written for a job that has finished or been
    /// replaced by a newer dispatch.
    pub async fn record_entry(
        &self,
        agg: &JobAggregate,
        entry: &PartialEntry,
    ) -> Result<Recorded, StoreError> {
        let subject = &agg.subject_id;
        let agg_key = keys::agg_key(subject);
        let raw = serde_json::to_string(entry)?;
        let inserted = self
            .store
            .hset_nx_counted(
                &keys::results_key(subject),
                &entry.item_id,
                &raw,
                progress_counter(&agg_key, &agg.job_id),
            )
            .await?;
        match inserted {
            CountedInsert::Counted(n) => {
                self.store
                    .hset_existing(&agg_key, &[(F_UPDATED, Utc::now().to_rfc3339())])
                    .await?;
                Ok(Recorded::Counted(n.max(0) as u64))
            }
            CountedInsert::Exists => Ok(Recorded::Duplicate),
            CountedInsert::Rejected => Ok(Recorded::JobGone),
        }
    }

    pub async fn has_entry(&self, subject: &SubjectId, item_id: &str) -> Result<bool, StoreError> {
        self.store.hexists(&keys::results_key(subject), item_id).await
    }

    /// Raw `item_id -> encoded entry` map.
    pub async fn raw_entries(
        &self,
        subject: &SubjectId,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.store.hget_all(&keys::results_key(subject)).await
    }

    /// Decoded entries. Undecodable values are logged and skipped.
    pub async fn entries(&self, subject: &SubjectId) -> Result<Vec<PartialEntry>, StoreError> {
        let raw = self.raw_entries(subject).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (item_id, value) in raw {
            match serde_json::from_str::<PartialEntry>(&value) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(
                    subject = %subject,
                    item_id = %item_id,
                    error = %e,
                    "skipping undecodable entry"
                ),
            }
        }
        Ok(out)
    }

    pub async fn remove_entries(
        &self,
        subject: &SubjectId,
        item_ids: &[ItemId],
    ) -> Result<u64, StoreError> {
        self.store.hdel(&keys::results_key(subject), item_ids).await
    }

    // ── Finalization ──────────────────────────────────────────

    /// One-shot claim on aggregation. Only the first caller gets `true`.
    pub async fn claim_finalize(
        &self,
        subject: &SubjectId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .set_nx(&keys::finalize_key(subject), &Utc::now().to_rfc3339(), Some(ttl))
            .await
    }

    pub async fn release_finalize(&self, subject: &SubjectId) -> Result<(), StoreError> {
        self.store.del(&[keys::finalize_key(subject)]).await?;
        Ok(())
    }

    /// Delete all transient job state and the dispatch lock.
    pub async fn clear_job(&self, subject: &SubjectId) -> Result<(), StoreError> {
        self.store
            .del(&[
                keys::agg_key(subject),
                keys::items_key(subject),
                keys::results_key(subject),
                keys::finalize_key(subject),
                keys::lock_key(subject),
            ])
            .await?;
        debug!(subject = %subject, "job state cleared");
        Ok(())
    }

    // ── Sticky status ─────────────────────────────────────────

    pub async fn record_status(
        &self,
        subject: &SubjectId,
        raw: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store.set(&keys::status_key(subject), raw, Some(ttl)).await
    }

    pub async fn last_status(&self, subject: &SubjectId) -> Result<Option<String>, StoreError> {
        self.store.get(&keys::status_key(subject)).await
    }

    pub async fn clear_status(&self, subject: &SubjectId) -> Result<(), StoreError> {
        self.store.del(&[keys::status_key(subject)]).await?;
        Ok(())
    }

    // ── Worker liveness ───────────────────────────────────────

    pub async fn heartbeat(
        &self,
        pool: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store.set(&keys::heartbeat_key(pool), payload, Some(ttl)).await
    }

    pub async fn last_heartbeat(&self, pool: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&keys::heartbeat_key(pool)).await
    }

    // ── Rate token ────────────────────────────────────────────

    /// Reserve the next outbound slot, returning its start (epoch ms).
    pub async fn rate_reserve(&self, now_ms: i64, interval_ms: i64) -> Result<i64, StoreError> {
        self.store.reserve_slot(keys::RATE_NEXT_KEY, now_ms, interval_ms).await
    }

    /// Block every caller until `until_ms` (epoch ms).
    pub async fn rate_penalize(&self, until_ms: i64, ttl: Duration) -> Result<(), StoreError> {
        let current = self.penalty_until().await?.unwrap_or(0);
        if until_ms > current {
            self.store
                .set(keys::RATE_PENALTY_KEY, &until_ms.to_string(), Some(ttl))
                .await?;
        }
        self.store.raise_slot(keys::RATE_NEXT_KEY, until_ms).await?;
        Ok(())
    }

    /// End of the active penalty, if one is in force.
    pub async fn penalty_until(&self) -> Result<Option<i64>, StoreError> {
        let Some(raw) = self.store.get(keys::RATE_PENALTY_KEY).await? else {
            return Ok(None);
        };
        raw.parse::<i64>()
            .map(Some)
            .map_err(|e| StoreError::corrupt(keys::RATE_PENALTY_KEY, e.to_string()))
    }
}

fn progress_counter<'a>(agg_key: &'a str, job_id: &'a str) -> GuardedCounter<'a> {
    GuardedCounter {
        key: agg_key,
        field: F_PROCESSED,
        guard_field: F_JOB_ID,
        guard_value: job_id,
    }
}

fn agg_fields(agg: &JobAggregate) -> Vec<(&'static str, String)> {
    vec![
        (F_SUBJECT, agg.subject_id.to_string()),
        (F_JOB_ID, agg.job_id.clone()),
        (F_REGION, agg.region.clone()),
        (F_PLAYER, agg.player_ref.clone()),
        (F_TOTAL, agg.total.to_string()),
        (F_PROCESSED, agg.processed.to_string()),
        (F_RESUMES, agg.resumes.to_string()),
        (F_CREATED, agg.created_at.to_rfc3339()),
        (F_UPDATED, agg.last_update_at.to_rfc3339()),
    ]
}

fn parse_agg(
    key: &str,
    subject: &SubjectId,
    fields: &HashMap<String, String>,
) -> Result<JobAggregate, StoreError> {
    let text = |name: &str| -> Result<&String, StoreError> {
        fields
            .get(name)
            .ok_or_else(|| StoreError::corrupt(key, format!("missing field '{name}'")))
    };
    let number = |name: &str| -> Result<u64, StoreError> {
        text(name)?
            .parse::<i64>()
            .map(|v| v.max(0) as u64)
            .map_err(|e| StoreError::corrupt(key, format!("field '{name}': {e}")))
    };
    let time = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(text(name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::corrupt(key, format!("field '{name}': {e}")))
    };

    Ok(JobAggregate {
        subject_id: fields
            .get(F_SUBJECT)
            .map(|s| SubjectId::from_raw(s.as_str()))
            .unwrap_or_else(|| subject.clone()),
        job_id: text(F_JOB_ID)?.clone(),
        region: text(F_REGION)?.clone(),
        player_ref: text(F_PLAYER)?.clone(),
        total: number(F_TOTAL)?,
        processed: number(F_PROCESSED)?,
        resumes: fields.get(F_RESUMES).and_then(|r| r.parse().ok()).unwrap_or(0),
        created_at: time(F_CREATED)?,
        last_update_at: time(F_UPDATED)?,
    })
}
