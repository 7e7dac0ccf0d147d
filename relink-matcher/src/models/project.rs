//! Project lifecycle state machine and record

use super::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Project lifecycle status
///
/// The happy path runs draft → active → pending_search → search_in_progress
/// → search_completed → pending_processing → processing → review_ready →
/// completed. Archiving is allowed from every status as an escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created, entries may still be loaded
    Draft,
    /// Ready to start matching
    Active,
    /// Start requested, coordinator job pending
    PendingSearch,
    /// Coordinator is fanning out search work
    SearchInProgress,
    /// Fan-out finished enqueuing
    SearchCompleted,
    /// Batches handed to the broker, awaiting workers
    PendingProcessing,
    /// Workers are matching tasks
    Processing,
    /// Batch finished with at least one failed task
    ProcessingFailed,
    /// All tasks settled, human review can begin
    ReviewReady,
    /// Review finished
    Completed,
    /// Terminal
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Active => "active",
            ProjectStatus::PendingSearch => "pending_search",
            ProjectStatus::SearchInProgress => "search_in_progress",
            ProjectStatus::SearchCompleted => "search_completed",
            ProjectStatus::PendingProcessing => "pending_processing",
            ProjectStatus::Processing => "processing",
            ProjectStatus::ProcessingFailed => "processing_failed",
            ProjectStatus::ReviewReady => "review_ready",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Archived => "archived",
        }
    }

    /// Statuses reachable from `self` in one step
    pub fn successors(&self) -> &'static [ProjectStatus] {
        use ProjectStatus::*;
        match self {
            Draft => &[Active, Archived],
            Active => &[PendingSearch, Archived],
            PendingSearch => &[SearchInProgress, Archived],
            SearchInProgress => &[SearchCompleted, Archived],
            SearchCompleted => &[PendingProcessing, Archived],
            PendingProcessing => &[Processing, ProcessingFailed, Archived],
            Processing => &[ReviewReady, ProcessingFailed, Archived],
            ProcessingFailed => &[PendingProcessing, Archived],
            ReviewReady => &[Completed, Archived],
            Completed => &[Archived],
            Archived => &[],
        }
    }

    pub fn can_transition(&self, to: ProjectStatus) -> bool {
        self.successors().contains(&to)
    }

    pub fn ensure_transition(&self, to: ProjectStatus) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(TransitionError {
                entity: "project",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = relink_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "draft" => ProjectStatus::Draft,
            "active" => ProjectStatus::Active,
            "pending_search" => ProjectStatus::PendingSearch,
            "search_in_progress" => ProjectStatus::SearchInProgress,
            "search_completed" => ProjectStatus::SearchCompleted,
            "pending_processing" => ProjectStatus::PendingProcessing,
            "processing" => ProjectStatus::Processing,
            "processing_failed" => ProjectStatus::ProcessingFailed,
            "review_ready" => ProjectStatus::ReviewReady,
            "completed" => ProjectStatus::Completed,
            "archived" => ProjectStatus::Archived,
            other => {
                return Err(relink_common::Error::InvalidValue(format!(
                    "unknown project status '{}'",
                    other
                )))
            }
        })
    }
}

/// One reconciliation project owning a batch of entries and their tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: ProjectStatus,
    /// JSON override of the scoring weights/rules, applied to every task
    pub scoring_config: Option<serde_json::Value>,
    pub soft_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
