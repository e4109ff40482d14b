//! The unit of work a fetch worker consumes.

use chrono::{DateTime, Utc};
use matchfan_core::{ItemId, JobAggregate, SubjectId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fetch one item for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    /// Unique per delivery attempt; a retry gets a fresh id.
    pub task_id: Uuid,
    pub subject_id: SubjectId,
    pub item_id: ItemId,
    /// Generation of the owning job. A task whose job has since been
    /// replaced is dropped instead of charging the new one.
    pub job_id: String,
    pub region: String,
    /// Resolved player identifier used to pick the participant.
    pub player_ref: String,
    /// Zero for the first delivery.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl FetchTask {
    /// Work for one item of `job`.
    pub fn for_job(job: &JobAggregate, item_id: impl Into<ItemId>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            subject_id: job.subject_id.clone(),
            job_id: job.job_id.clone(),
            item_id: item_id.into(),
            region: job.region.clone(),
            player_ref: job.player_ref.clone(),
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The same work, redelivered as the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobAggregate {
        JobAggregate::new(SubjectId::from_raw("a#b@euw"), "euw", "puuid", 1)
    }

    #[test]
    fn task_carries_the_job_generation() {
        let job = job();
        let task = FetchTask::for_job(&job, "EUW1_1");
        assert_eq!(task.job_id, job.job_id);
        assert_eq!(task.player_ref, "puuid");
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn next_attempt_keeps_work_and_changes_identity() {
        let task = FetchTask::for_job(&job(), "EUW1_1");
        let retry = task.next_attempt();
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.item_id, task.item_id);
        assert_ne!(retry.task_id, task.task_id);
    }

    #[test]
    fn task_wire_shape() {
        let task = FetchTask::for_job(&job(), "EUW1_1");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["subject_id"], "a#b@euw");
        assert_eq!(json["item_id"], "EUW1_1");
        assert_eq!(json["attempt"], 0);
    }
}
