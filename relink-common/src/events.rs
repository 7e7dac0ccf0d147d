//! Event types for the Relink event system
//!
//! Provides shared event definitions and the `EventBus` used by the matching
//! pipeline and the HTTP layer. Events are broadcast in-process and can be
//! serialized for SSE transmission; emission is fire-and-forget and never
//! affects pipeline control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Relink event types
///
/// Broadcast via [`EventBus`]; every variant is serializable so the SSE
/// endpoint can forward it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelinkEvent {
    /// A project entered the matching pipeline
    ProjectStarted {
        /// Project UUID
        project_id: Uuid,
        /// Number of tasks created by this start request
        tasks_created: u64,
        /// When the project was started
        timestamp: DateTime<Utc>,
    },

    /// A task finished matching with a persisted candidate set
    TaskMatched {
        /// Task UUID
        task_id: Uuid,
        /// Owning project UUID
        project_id: Uuid,
        /// Number of candidates now attached to the task
        candidate_count: i64,
        /// Highest candidate score, if any candidates exist
        highest_score: Option<i64>,
        /// When matching completed
        timestamp: DateTime<Utc>,
    },

    /// A task was marked failed (permanent error or exhausted retries)
    TaskFailed {
        /// Task UUID
        task_id: Uuid,
        /// Owning project UUID
        project_id: Uuid,
        /// Human-readable failure description
        message: String,
        /// When the failure was recorded
        timestamp: DateTime<Utc>,
    },

    /// A project's status was rolled up after fan-out completion
    ProjectRollup {
        /// Project UUID
        project_id: Uuid,
        /// Resulting project status (`review_ready` or `processing_failed`)
        status: String,
        /// When the roll-up was applied
        timestamp: DateTime<Utc>,
    },

    /// The sweeper re-enqueued stale in-flight tasks
    TasksSwept {
        /// Number of tasks re-enqueued in this pass
        count: u64,
        /// When the pass ran
        timestamp: DateTime<Utc>,
    },

    /// A job exhausted its retries and was routed to the dead letter table
    JobDeadLettered {
        /// Job envelope UUID
        job_id: Uuid,
        /// Job type as stored on the broker
        job_type: String,
        /// When the job was dead-lettered
        timestamp: DateTime<Utc>,
    },
}

impl RelinkEvent {
    /// Event type name used as the SSE event field
    pub fn event_type(&self) -> &str {
        match self {
            RelinkEvent::ProjectStarted { .. } => "ProjectStarted",
            RelinkEvent::TaskMatched { .. } => "TaskMatched",
            RelinkEvent::TaskFailed { .. } => "TaskFailed",
            RelinkEvent::ProjectRollup { .. } => "ProjectRollup",
            RelinkEvent::TasksSwept { .. } => "TasksSwept",
            RelinkEvent::JobDeadLettered { .. } => "JobDeadLettered",
        }
    }
}

/// In-process broadcast bus for [`RelinkEvent`]
///
/// Subscribers joining after an event was emitted do not receive it; slow
/// subscribers may observe lag and lose the oldest buffered events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelinkEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RelinkEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: RelinkEvent,
    ) -> Result<usize, broadcast::error::SendError<RelinkEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: RelinkEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
