//! Job envelope: the self-contained message handed to the broker
//!
//! Payloads carry entity-store IDs only, never row contents. Envelopes are
//! ephemeral; they exist on the broker tables and in worker memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed job payload, tagged by job type in its JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Fan-out plus completion check for one project
    Coordinator {
        project_id: Uuid,
        /// Explicit task list (rerun); absent → all `new` tasks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_ids: Option<Vec<Uuid>>,
    },
    /// One chunk of tasks to match
    MatchEntry {
        project_id: Uuid,
        task_ids: Vec<Uuid>,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::Coordinator { .. } => "coordinator",
            JobPayload::MatchEntry { .. } => "match_entry",
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            JobPayload::Coordinator { project_id, .. } => *project_id,
            JobPayload::MatchEntry { project_id, .. } => *project_id,
        }
    }
}

/// Broker message with delivery bookkeeping
///
/// `attempt` counts completed deliveries: 0 on first dequeue, bumped by
/// every nack and every visibility-timeout reclaim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Idempotency and correlation key
    pub job_id: Uuid,
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        JobEnvelope {
            job_id: Uuid::new_v4(),
            attempt: 0,
            max_attempts,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.payload.job_type()
    }

    /// True when a further transient failure must dead-letter instead of
    /// retrying.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_tagging() {
        let payload = JobPayload::MatchEntry {
            project_id: Uuid::nil(),
            task_ids: vec![Uuid::nil()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["job_type"], "match_entry");
        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_coordinator_payload_omits_absent_task_ids() {
        let payload = JobPayload::Coordinator {
            project_id: Uuid::nil(),
            task_ids: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("task_ids").is_none());
    }

    #[test]
    fn test_final_attempt_budget() {
        let mut env = JobEnvelope::new(
            JobPayload::Coordinator {
                project_id: Uuid::nil(),
                task_ids: None,
            },
            3,
        );
        assert!(!env.is_final_attempt()); // attempt 0 of 3
        env.attempt = 1;
        assert!(!env.is_final_attempt());
        env.attempt = 2;
        assert!(env.is_final_attempt());
    }
}
