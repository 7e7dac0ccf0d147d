//! Candidate state machine, provenance, and record

use super::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Candidate review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    /// Proposed, no decision yet
    Suggested,
    /// Chosen as the match (terminal)
    Accepted,
    /// Ruled out (terminal)
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Suggested => "suggested",
            CandidateStatus::Accepted => "accepted",
            CandidateStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CandidateStatus::Accepted | CandidateStatus::Rejected)
    }

    /// Table check. Terminal statuses may only be re-targeted with `force`,
    /// and never back to suggested.
    pub fn can_transition(&self, to: CandidateStatus, force: bool) -> bool {
        match self {
            CandidateStatus::Suggested => {
                matches!(to, CandidateStatus::Accepted | CandidateStatus::Rejected)
            }
            CandidateStatus::Accepted | CandidateStatus::Rejected => {
                force && to != CandidateStatus::Suggested && to != *self
            }
        }
    }

    pub fn ensure_transition(
        &self,
        to: CandidateStatus,
        force: bool,
    ) -> Result<(), TransitionError> {
        if self.can_transition(to, force) {
            Ok(())
        } else {
            Err(TransitionError {
                entity: "candidate",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = relink_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "suggested" => CandidateStatus::Suggested,
            "accepted" => CandidateStatus::Accepted,
            "rejected" => CandidateStatus::Rejected,
            other => {
                return Err(relink_common::Error::InvalidValue(format!(
                    "unknown candidate status '{}'",
                    other
                )))
            }
        })
    }
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Produced by the matching pipeline
    AutomatedSearch,
    /// Entered by a reviewer
    Manual,
    /// Carried in with an imported file
    FileImport,
    /// Proposed by an assistant integration
    AiSuggestion,
    /// Pre-resolved knowledge-base link
    KnowledgeBase,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::AutomatedSearch => "automated_search",
            CandidateSource::Manual => "manual",
            CandidateSource::FileImport => "file_import",
            CandidateSource::AiSuggestion => "ai_suggestion",
            CandidateSource::KnowledgeBase => "knowledge_base",
        }
    }
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateSource {
    type Err = relink_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "automated_search" => CandidateSource::AutomatedSearch,
            "manual" => CandidateSource::Manual,
            "file_import" => CandidateSource::FileImport,
            "ai_suggestion" => CandidateSource::AiSuggestion,
            "knowledge_base" => CandidateSource::KnowledgeBase,
            other => {
                return Err(relink_common::Error::InvalidValue(format!(
                    "unknown candidate source '{}'",
                    other
                )))
            }
        })
    }
}

/// A proposed match between a task's entry and a knowledge-base entity
///
/// The same external entity may appear more than once for one task when the
/// provenance differs; candidates are not deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub task_id: Uuid,
    /// External knowledge-base identifier (e.g. `Q12345`)
    pub entity_id: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub status: CandidateStatus,
    pub source: CandidateSource,
    /// 0..=100
    pub score: i64,
    /// Component-key → component-score map plus confidence, as produced by
    /// the scoring engine; null for manual candidates
    pub score_breakdown: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
