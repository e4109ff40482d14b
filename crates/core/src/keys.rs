//! Store key namespace.
//!
//! Every coordination key is derived here so the dispatcher, workers,
//! aggregator and reconciler agree on names.

use crate::model::SubjectId;

/// Shared "next call not before" slot for the rate gate.
pub const RATE_NEXT_KEY: &str = "rate:next";

/// Set while a server-mandated backoff is in force.
pub const RATE_PENALTY_KEY: &str = "rate:penalty";

/// Glob matching every live job aggregate.
pub const AGG_SCAN_PATTERN: &str = "job:*:agg";

pub fn cache_key(subject: &SubjectId) -> String {
    format!("cache:{subject}")
}

pub fn cooldown_key(subject: &SubjectId) -> String {
    format!("cooldown:{subject}")
}

pub fn lock_key(subject: &SubjectId) -> String {
    format!("lock:{subject}")
}

pub fn status_key(subject: &SubjectId) -> String {
    format!("status:{subject}")
}

pub fn job_prefix(subject: &SubjectId) -> String {
    format!("job:{subject}")
}

pub fn agg_key(subject: &SubjectId) -> String {
    format!("job:{subject}:agg")
}

pub fn items_key(subject: &SubjectId) -> String {
    format!("job:{subject}:items")
}

pub fn results_key(subject: &SubjectId) -> String {
    format!("job:{subject}:results")
}

pub fn finalize_key(subject: &SubjectId) -> String {
    format!("job:{subject}:finalize")
}

pub fn heartbeat_key(pool: &str) -> String {
    format!("worker:heartbeat:{pool}")
}

/// Ready list of fetch tasks for a worker pool.
pub fn queue_key(pool: &str) -> String {
    format!("queue:{pool}:ready")
}

/// Tasks waiting out a retry backoff, scored by due time (epoch ms).
pub fn delayed_queue_key(pool: &str) -> String {
    format!("queue:{pool}:delayed")
}

/// Recover the subject from a `job:{subject}:agg` key.
pub fn subject_from_agg_key(key: &str) -> Option<SubjectId> {
    key.strip_prefix("job:")
        .and_then(|rest| rest.strip_suffix(":agg"))
        .filter(|s| !s.is_empty())
        .map(SubjectId::from_raw)
}
