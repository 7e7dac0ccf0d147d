//! Data models for relink-matcher
//!
//! Status state machines are closed enums with static transition tables.
//! Both the API layer and the worker loop consult the same tables; a
//! disallowed change surfaces as [`TransitionError`] (409 at the API,
//! log-and-ack inside the worker).

pub mod candidate;
pub mod entry;
pub mod job;
pub mod project;
pub mod task;

pub use candidate::{Candidate, CandidateSource, CandidateStatus};
pub use entry::Entry;
pub use job::{JobEnvelope, JobPayload};
pub use project::{Project, ProjectStatus};
pub use task::{Task, TaskStatus};

use thiserror::Error;

/// Entity kinds governed by a status state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Project,
    Task,
    Candidate,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Task => "task",
            EntityKind::Candidate => "candidate",
        }
    }
}

/// A status change the transition table does not allow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot transition {entity} from '{from}' to '{to}'")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Table lookup over raw status strings.
///
/// Unknown status text is always invalid. Candidate transitions are checked
/// without the terminal-override flag; callers that honor the flag go
/// through [`CandidateStatus::ensure_transition`] directly.
pub fn validate_transition(kind: EntityKind, from: &str, to: &str) -> bool {
    match kind {
        EntityKind::Project => match (from.parse::<ProjectStatus>(), to.parse::<ProjectStatus>()) {
            (Ok(f), Ok(t)) => f.can_transition(t),
            _ => false,
        },
        EntityKind::Task => match (from.parse::<TaskStatus>(), to.parse::<TaskStatus>()) {
            (Ok(f), Ok(t)) => f.can_transition(t),
            _ => false,
        },
        EntityKind::Candidate => {
            match (from.parse::<CandidateStatus>(), to.parse::<CandidateStatus>()) {
                (Ok(f), Ok(t)) => f.can_transition(t, false),
                _ => false,
            }
        }
    }
}
