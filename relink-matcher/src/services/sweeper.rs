//! Sweeper: staleness repair loop
//!
//! Tasks stuck in `queued_for_processing` or `processing` past the
//! staleness threshold get fresh `match_entry` jobs. Safe under
//! at-least-once delivery because workers re-validate status and settle
//! through conditional writes. This is the repair path for broker writes
//! lost after the task rows committed; it also re-triggers the completion
//! check for projects parked in `processing` with nothing left in flight.

use crate::db;
use crate::db::queue::BrokerError;
use crate::services::dispatcher::JobDispatcher;
use relink_common::events::{EventBus, RelinkEvent};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on tasks re-enqueued per pass
const SWEEP_BATCH_LIMIT: i64 = 1000;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Db(#[from] relink_common::Error),

    #[error("broker enqueue failed: {0}")]
    Broker(#[from] BrokerError),
}

pub struct Sweeper {
    db: SqlitePool,
    dispatcher: JobDispatcher,
    event_bus: EventBus,
    interval: Duration,
    staleness_threshold_secs: u64,
    chunk_size: usize,
}

impl Sweeper {
    pub fn new(
        db: SqlitePool,
        dispatcher: JobDispatcher,
        event_bus: EventBus,
        pipeline: &crate::config::PipelineConfig,
    ) -> Self {
        Sweeper {
            db,
            dispatcher,
            event_bus,
            interval: Duration::from_secs(pipeline.sweep_interval_secs.max(1)),
            staleness_threshold_secs: pipeline.staleness_threshold_secs,
            chunk_size: pipeline.chunk_size.max(1),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!("sweeper started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.sweep_once().await {
                Ok(0) => debug!("sweep pass: nothing stale"),
                Ok(count) => info!("sweep pass re-enqueued {} tasks", count),
                Err(e) => warn!("sweep pass failed: {}", e),
            }
        }
        info!("sweeper stopped");
    }

    /// One pass; returns the number of re-enqueued tasks
    pub async fn sweep_once(&self) -> Result<u64, SweepError> {
        let cutoff = relink_common::time::now()
            - chrono::Duration::seconds(self.staleness_threshold_secs as i64);

        let stale = db::tasks::stale_inflight_tasks(&self.db, &cutoff, SWEEP_BATCH_LIMIT).await?;
        let mut swept = 0u64;
        if !stale.is_empty() {
            let mut per_project: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
            for task in &stale {
                per_project.entry(task.project_id).or_default().push(task.id);
            }
            for (project_id, task_ids) in per_project {
                warn!(
                    "project {}: {} tasks stale, re-enqueueing",
                    project_id,
                    task_ids.len()
                );
                swept += task_ids.len() as u64;
                for chunk in task_ids.chunks(self.chunk_size) {
                    self.dispatcher
                        .enqueue_match_batch(project_id, chunk.to_vec())
                        .await?;
                }
            }
            self.event_bus.emit_lossy(RelinkEvent::TasksSwept {
                count: swept,
                timestamp: relink_common::time::now(),
            });
        }

        self.recheck_stalled_projects(&cutoff).await?;
        Ok(swept)
    }

    /// Re-trigger the completion check for projects that stopped moving
    /// with no task left in flight (a lost batch-end enqueue).
    async fn recheck_stalled_projects(
        &self,
        cutoff: &chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SweepError> {
        let project_ids = db::projects::stalled_processing_projects(&self.db, cutoff).await?;
        for project_id in project_ids {
            if db::tasks::count_unfinished_tasks(&self.db, project_id).await? == 0 {
                debug!("project {}: re-triggering completion check", project_id);
                self.dispatcher.enqueue_coordinator(project_id, None).await?;
            }
        }
        Ok(())
    }
}
