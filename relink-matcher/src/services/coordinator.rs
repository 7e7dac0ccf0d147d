//! Coordinator: project fan-out and completion roll-up
//!
//! A coordinator job delivery is interpreted against the project's current
//! status. Fresh starts flip `new` tasks to `queued_for_processing` and
//! emit fixed-size `match_entry` batches; reruns fan out an explicit task
//! list; a project already `processing` gets a completion check. Every
//! status flip is a conditional write, so duplicate deliveries and
//! concurrent archives resolve to no-ops.

use crate::db;
use crate::db::queue::BrokerError;
use crate::models::{ProjectStatus, TaskStatus};
use crate::services::dispatcher::JobDispatcher;
use relink_common::events::{EventBus, RelinkEvent};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Coordinator failures are all transient; obsolete deliveries are an
/// outcome, not an error.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Db(#[from] relink_common::Error),

    #[error("broker enqueue failed: {0}")]
    Broker(#[from] BrokerError),
}

/// What a coordinator delivery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorOutcome {
    /// Tasks queued and batch jobs emitted
    FannedOut { queued: u64, batches: u64 },
    /// Finished project rolled up
    RolledUp { status: ProjectStatus },
    /// Tasks still in flight; a later batch completion re-triggers the check
    InFlight { remaining: i64 },
    /// Missing, soft-deleted, or in a status with no coordinator action
    Obsolete,
}

pub struct Coordinator {
    db: SqlitePool,
    dispatcher: JobDispatcher,
    event_bus: EventBus,
    chunk_size: usize,
}

impl Coordinator {
    pub fn new(
        db: SqlitePool,
        dispatcher: JobDispatcher,
        event_bus: EventBus,
        chunk_size: usize,
    ) -> Self {
        Coordinator {
            db,
            dispatcher,
            event_bus,
            chunk_size,
        }
    }

    pub async fn run(
        &self,
        project_id: Uuid,
        explicit_task_ids: Option<&[Uuid]>,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let Some(project) = db::projects::get_project(&self.db, project_id).await? else {
            debug!("coordinator job for unknown project {}", project_id);
            return Ok(CoordinatorOutcome::Obsolete);
        };
        if project.soft_deleted {
            return Ok(CoordinatorOutcome::Obsolete);
        }

        match project.status {
            ProjectStatus::PendingSearch => self.fan_out_fresh(project_id).await,
            ProjectStatus::PendingProcessing => {
                self.fan_out_rerun(project_id, explicit_task_ids).await
            }
            ProjectStatus::Processing => self.completion_check(project_id).await,
            status => {
                debug!(
                    "coordinator job for project {} in status {}: obsolete",
                    project_id, status
                );
                Ok(CoordinatorOutcome::Obsolete)
            }
        }
    }

    /// Fresh start: queue every `new` task and emit batch jobs
    async fn fan_out_fresh(
        &self,
        project_id: Uuid,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let moved = db::projects::conditional_update_project_status(
            &self.db,
            project_id,
            ProjectStatus::PendingSearch,
            ProjectStatus::SearchInProgress,
        )
        .await?;
        if moved == 0 {
            return Ok(CoordinatorOutcome::Obsolete);
        }

        let new_ids = db::tasks::task_ids_with_status(&self.db, project_id, TaskStatus::New).await?;
        let mut queued: Vec<Uuid> = Vec::with_capacity(new_ids.len());
        for task_id in new_ids {
            let rows = db::tasks::conditional_update_task_status(
                &self.db,
                task_id,
                TaskStatus::New,
                TaskStatus::QueuedForProcessing,
            )
            .await?;
            if rows > 0 {
                queued.push(task_id);
            }
        }

        let batches = self.emit_batches(project_id, &queued).await?;

        // walk the search bookkeeping statuses through to processing
        for (from, to) in [
            (ProjectStatus::SearchInProgress, ProjectStatus::SearchCompleted),
            (ProjectStatus::SearchCompleted, ProjectStatus::PendingProcessing),
            (ProjectStatus::PendingProcessing, ProjectStatus::Processing),
        ] {
            let rows =
                db::projects::conditional_update_project_status(&self.db, project_id, from, to)
                    .await?;
            if rows == 0 {
                // concurrent archive; workers will drop their results too
                return Ok(CoordinatorOutcome::Obsolete);
            }
        }

        if batches == 0 {
            // a project with no matchable tasks has no batch completion to
            // trigger the roll-up, so check immediately
            self.dispatcher.enqueue_coordinator(project_id, None).await?;
        }

        info!(
            "project {}: queued {} tasks in {} batches",
            project_id,
            queued.len(),
            batches
        );
        Ok(CoordinatorOutcome::FannedOut {
            queued: queued.len() as u64,
            batches,
        })
    }

    /// Rerun: fan out the explicit list, or whatever is still queued
    async fn fan_out_rerun(
        &self,
        project_id: Uuid,
        explicit: Option<&[Uuid]>,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let moved = db::projects::conditional_update_project_status(
            &self.db,
            project_id,
            ProjectStatus::PendingProcessing,
            ProjectStatus::Processing,
        )
        .await?;
        if moved == 0 {
            return Ok(CoordinatorOutcome::Obsolete);
        }

        let task_ids: Vec<Uuid> = match explicit {
            Some(ids) => ids.to_vec(),
            None => {
                db::tasks::task_ids_with_status(
                    &self.db,
                    project_id,
                    TaskStatus::QueuedForProcessing,
                )
                .await?
            }
        };
        let batches = self.emit_batches(project_id, &task_ids).await?;

        if batches == 0 {
            self.dispatcher.enqueue_coordinator(project_id, None).await?;
        }

        info!(
            "project {}: rerun fanned out {} tasks in {} batches",
            project_id,
            task_ids.len(),
            batches
        );
        Ok(CoordinatorOutcome::FannedOut {
            queued: task_ids.len() as u64,
            batches,
        })
    }

    /// Roll the project up once no task remains in flight
    async fn completion_check(
        &self,
        project_id: Uuid,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let remaining = db::tasks::count_unfinished_tasks(&self.db, project_id).await?;
        if remaining > 0 {
            debug!("project {}: {} tasks still in flight", project_id, remaining);
            return Ok(CoordinatorOutcome::InFlight { remaining });
        }

        let failed =
            db::tasks::count_tasks_with_status(&self.db, project_id, TaskStatus::Failed).await?;
        let target = if failed > 0 {
            ProjectStatus::ProcessingFailed
        } else {
            ProjectStatus::ReviewReady
        };

        let rows = db::projects::conditional_update_project_status(
            &self.db,
            project_id,
            ProjectStatus::Processing,
            target,
        )
        .await?;
        if rows == 0 {
            return Ok(CoordinatorOutcome::Obsolete);
        }

        self.event_bus.emit_lossy(RelinkEvent::ProjectRollup {
            project_id,
            status: target.as_str().to_string(),
            timestamp: relink_common::time::now(),
        });
        info!("project {} rolled up to {}", project_id, target);
        Ok(CoordinatorOutcome::RolledUp { status: target })
    }

    async fn emit_batches(
        &self,
        project_id: Uuid,
        task_ids: &[Uuid],
    ) -> Result<u64, CoordinatorError> {
        let mut batches = 0u64;
        for chunk in task_ids.chunks(self.chunk_size.max(1)) {
            self.dispatcher
                .enqueue_match_batch(project_id, chunk.to_vec())
                .await?;
            batches += 1;
        }
        Ok(batches)
    }
}
