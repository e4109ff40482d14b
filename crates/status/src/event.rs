use chrono::{DateTime, Utc};
use matchfan_core::SubjectId;
use serde::{Deserialize, Serialize};

/// Status of a subject's fetch job, as seen by external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Progress { processed: u64, total: u64 },
    Completed,
    Failed { error: String },
    NoMatches,
}

impl JobStatus {
    pub fn failed(error: impl Into<String>) -> Self {
        JobStatus::Failed { error: error.into() }
    }

    /// Terminal statuses end a job and are kept for pollers.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Progress { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Progress { .. } => "progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::NoMatches => "no_matches",
        }
    }
}

/// A status change for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub subject: SubjectId,
    #[serde(flatten)]
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(subject: SubjectId, status: JobStatus) -> Self {
        Self {
            subject,
            status,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_payload_shapes() {
        let progress =
            serde_json::to_value(JobStatus::Progress { processed: 2, total: 5 }).unwrap();
        assert_eq!(progress, serde_json::json!({"status": "progress", "processed": 2, "total": 5}));

        let done = serde_json::to_value(JobStatus::Completed).unwrap();
        assert_eq!(done, serde_json::json!({"status": "completed"}));

        let failed = serde_json::to_value(JobStatus::failed("boom")).unwrap();
        assert_eq!(failed, serde_json::json!({"status": "failed", "error": "boom"}));

        let none = serde_json::to_value(JobStatus::NoMatches).unwrap();
        assert_eq!(none, serde_json::json!({"status": "no_matches"}));
    }

    #[test]
    fn event_flattens_status() {
        let event = StatusEvent::new(SubjectId::from_raw("a#b@euw"), JobStatus::Completed);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["subject"], "a#b@euw");

        let back: StatusEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, JobStatus::Completed);
    }

    #[test]
    fn only_progress_is_non_terminal() {
        assert!(!JobStatus::Progress { processed: 0, total: 1 }.is_terminal());
        assert!(JobStatus::NoMatches.is_terminal());
        assert!(JobStatus::failed("x").is_terminal());
    }
}
