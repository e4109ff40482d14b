use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of one remote item (a match id).
pub type ItemId = String;

/// Platform tags accepted for a player handle, with their regional route.
const REGION_ROUTES: &[(&str, &str)] = &[
    ("na", "americas"),
    ("br", "americas"),
    ("euw", "europe"),
    ("eune", "europe"),
    ("kr", "asia"),
];

/// Map a platform tag (e.g. `euw`) to the regional routing host prefix.
pub fn regional_route(region: &str) -> Result<&'static str, CoreError> {
    let wanted = region.trim().to_lowercase();
    REGION_ROUTES
        .iter()
        .find(|(tag, _)| *tag == wanted)
        .map(|(_, route)| *route)
        .ok_or_else(|| CoreError::InvalidRegion(region.to_string()))
}

// ── Subject ───────────────────────────────────────────────────

/// Stable key for the entity a job fetches data for: `name#tag@region`, lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn from_handle(game_name: &str, tag_line: &str, region: &str) -> Result<Self, CoreError> {
        let name = game_name.trim();
        let tag = tag_line.trim();
        if name.is_empty() || tag.is_empty() {
            return Err(CoreError::InvalidHandle(format!("{game_name}#{tag_line}")));
        }
        if name.contains(['#', '@', ':']) || tag.contains(['#', '@', ':']) {
            return Err(CoreError::InvalidHandle(format!(
                "'{game_name}#{tag_line}' contains a reserved character"
            )));
        }
        regional_route(region)?;
        Ok(Self(format!(
            "{}#{}@{}",
            name.to_lowercase(),
            tag.to_lowercase(),
            region.trim().to_lowercase()
        )))
    }

    /// Wrap an already-normalised key (e.g. parsed back out of a store key).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The region suffix, if the id carries one.
    pub fn region(&self) -> Option<&str> {
        self.0.rsplit_once('@').map(|(_, r)| r)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A human-readable player handle plus the platform it plays on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerHandle {
    pub game_name: String,
    pub tag_line: String,
    pub region: String,
}

impl PlayerHandle {
    pub fn new(
        game_name: impl Into<String>,
        tag_line: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            game_name: game_name.into(),
            tag_line: tag_line.into(),
            region: region.into(),
        }
    }

    pub fn subject_id(&self) -> Result<SubjectId, CoreError> {
        SubjectId::from_handle(&self.game_name, &self.tag_line, &self.region)
    }
}

impl fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.game_name, self.tag_line, self.region)
    }
}

// ── Item payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    Win,
    Loss,
}

/// The per-match slice of data kept for a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id: ItemId,
    /// Game creation time, epoch milliseconds. Sort key for the artifact.
    pub timestamp: i64,
    pub outcome: MatchOutcome,
    pub champion: String,
    pub role: String,
}

/// Placeholder for an item that could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub item_id: ItemId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    Payload(MatchSummary),
    Tombstone { reason: String },
}

/// One entry of a job's partial result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialEntry {
    pub item_id: ItemId,
    pub outcome: ItemOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl PartialEntry {
    pub fn payload(summary: MatchSummary) -> Self {
        Self {
            item_id: summary.match_id.clone(),
            outcome: ItemOutcome::Payload(summary),
            recorded_at: Utc::now(),
        }
    }

    pub fn tombstone(item_id: impl Into<ItemId>, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            outcome: ItemOutcome::Tombstone { reason: reason.into() },
            recorded_at: Utc::now(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Tombstone { .. })
    }
}

// ── Job state ─────────────────────────────────────────────────

/// Progress record for a job in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAggregate {
    pub subject_id: SubjectId,
    /// Generation of this job. Tasks carry it so work left over from an
    /// earlier job for the same subject is recognised and dropped.
    pub job_id: String,
    pub region: String,
    /// Resolved stable player identifier (puuid).
    pub player_ref: String,
    pub total: u64,
    pub processed: u64,
    /// Times reconciliation has resumed this job.
    pub resumes: u32,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl JobAggregate {
    pub fn new(
        subject_id: SubjectId,
        region: impl Into<String>,
        player_ref: impl Into<String>,
        total: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            subject_id,
            job_id: Uuid::new_v4().to_string(),
            region: region.into(),
            player_ref: player_ref.into(),
            total,
            processed: 0,
            resumes: 0,
            created_at: now,
            last_update_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.processed >= self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed)
    }

    /// True when no progress has been recorded for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        let threshold =
            ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::days(36_500));
        now.signed_duration_since(self.last_update_at) > threshold
    }
}

/// The final per-subject result, replaced wholesale by each successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub subject_id: SubjectId,
    /// Payloads, most recent first.
    pub matches: Vec<MatchSummary>,
    pub tombstones: Vec<Tombstone>,
    /// Items accounted for by the job (payloads + tombstones).
    pub total: u64,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedArtifact {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether some items were tombstoned rather than fetched.
    pub fn is_partial(&self) -> bool {
        !self.tombstones.is_empty()
    }

    /// Chunked view for consumers that take fixed-size pages.
    pub fn pages(&self, page_size: usize) -> impl Iterator<Item = &[MatchSummary]> {
        self.matches.chunks(page_size.max(1))
    }

    pub fn page_count(&self, page_size: usize) -> usize {
        self.matches.len().div_ceil(page_size.max(1))
    }

    /// Zero-based page, or `None` past the end.
    pub fn page(&self, index: usize, page_size: usize) -> Option<&[MatchSummary]> {
        self.pages(page_size).nth(index)
    }
}
