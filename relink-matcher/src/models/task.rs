//! Task state machine and record
//!
//! A task binds one entry to one project and tracks it through matching
//! and review. Workers own tasks in {queued_for_processing, processing};
//! the API owns them everywhere else.

use super::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to the pipeline
    New,
    /// Claimed by the coordinator, waiting for a worker
    QueuedForProcessing,
    /// A worker is matching it right now
    Processing,
    /// Matching failed; retryable
    Failed,
    /// Search returned nothing
    NoCandidatesFound,
    /// Candidates written, waiting for a human decision
    AwaitingReview,
    /// A candidate was accepted (terminal)
    Reviewed,
    /// Accepted without review by the auto-accept hook (terminal)
    AutoConfirmed,
    /// Reviewer declined to match it (terminal)
    Skipped,
    /// Resolved out-of-band against the knowledge base (terminal)
    KnowledgeBased,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::QueuedForProcessing => "queued_for_processing",
            TaskStatus::Processing => "processing",
            TaskStatus::Failed => "failed",
            TaskStatus::NoCandidatesFound => "no_candidates_found",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::Reviewed => "reviewed",
            TaskStatus::AutoConfirmed => "auto_confirmed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::KnowledgeBased => "knowledge_based",
        }
    }

    /// Statuses reachable from `self` in one step
    pub fn successors(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            New => &[QueuedForProcessing, KnowledgeBased],
            QueuedForProcessing => &[Processing],
            Processing => &[Failed, NoCandidatesFound, AwaitingReview],
            Failed => &[QueuedForProcessing],
            NoCandidatesFound => &[Skipped],
            AwaitingReview => &[Reviewed, Skipped, AutoConfirmed, KnowledgeBased],
            Reviewed | AutoConfirmed | Skipped | KnowledgeBased => &[],
        }
    }

    pub fn can_transition(&self, to: TaskStatus) -> bool {
        self.successors().contains(&to)
    }

    pub fn ensure_transition(&self, to: TaskStatus) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(TransitionError {
                entity: "task",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Worker-owned statuses; only tasks in these states may be mutated by
    /// the pipeline.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::QueuedForProcessing | TaskStatus::Processing)
    }

    /// Counts toward review progress in project stats
    pub fn is_settled_by_review(&self) -> bool {
        matches!(
            self,
            TaskStatus::Reviewed
                | TaskStatus::AutoConfirmed
                | TaskStatus::Skipped
                | TaskStatus::KnowledgeBased
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = relink_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => TaskStatus::New,
            "queued_for_processing" => TaskStatus::QueuedForProcessing,
            "processing" => TaskStatus::Processing,
            "failed" => TaskStatus::Failed,
            "no_candidates_found" => TaskStatus::NoCandidatesFound,
            "awaiting_review" => TaskStatus::AwaitingReview,
            "reviewed" => TaskStatus::Reviewed,
            "auto_confirmed" => TaskStatus::AutoConfirmed,
            "skipped" => TaskStatus::Skipped,
            "knowledge_based" => TaskStatus::KnowledgeBased,
            other => {
                return Err(relink_common::Error::InvalidValue(format!(
                    "unknown task status '{}'",
                    other
                )))
            }
        })
    }
}

/// One unit of reconciliation work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub entry_id: Uuid,
    pub status: TaskStatus,
    /// Set when a candidate is accepted
    pub accepted_candidate_id: Option<Uuid>,
    /// External knowledge-base identifier of the accepted candidate
    pub accepted_entity_id: Option<String>,
    /// Denormalized candidate count, maintained with every candidate write
    pub candidate_count: i64,
    /// Maximum score among this task's candidates, null when there are none
    pub highest_score: Option<i64>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
