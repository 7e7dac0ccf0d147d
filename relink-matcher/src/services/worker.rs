//! Worker pool: dequeue, execute, ack/nack
//!
//! The single place that classifies job errors. Transient failures nack
//! the whole batch with exponential backoff until the attempt budget runs
//! out, then the current task is marked failed and the job dead-lettered.
//! Permanent failures mark the task failed and the batch keeps going.
//! Zero-row conditional writes are expected races, never errors.

use crate::db;
use crate::db::queue::{Broker, BrokerError, DeliveredJob};
use crate::models::{JobPayload, TaskStatus};
use crate::services::coordinator::Coordinator;
use crate::services::dispatcher::JobDispatcher;
use crate::services::matcher::{MatchOutcome, Matcher, MatcherError};
use relink_common::events::{EventBus, RelinkEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct WorkerPool {
    db: SqlitePool,
    broker: Arc<dyn Broker>,
    dispatcher: JobDispatcher,
    matcher: Matcher,
    coordinator: Coordinator,
    event_bus: EventBus,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
    dequeue_poll: Duration,
    worker_count: usize,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        broker: Arc<dyn Broker>,
        dispatcher: JobDispatcher,
        matcher: Matcher,
        coordinator: Coordinator,
        event_bus: EventBus,
        pipeline: &crate::config::PipelineConfig,
    ) -> Self {
        WorkerPool {
            db,
            broker,
            dispatcher,
            matcher,
            coordinator,
            event_bus,
            backoff_base_secs: pipeline.backoff_base_secs,
            backoff_cap_secs: pipeline.backoff_cap_secs,
            dequeue_poll: Duration::from_secs(pipeline.dequeue_poll_secs.max(1)),
            worker_count: pipeline.worker_count.max(1),
        }
    }

    /// Spawn the fixed-size worker pool; each loop drains until cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|index| {
                let pool = self.clone();
                let token = shutdown.clone();
                tokio::spawn(async move { pool.run_loop(index, token).await })
            })
            .collect()
    }

    async fn run_loop(&self, index: usize, shutdown: CancellationToken) {
        info!("worker {} started", index);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.handle_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.dequeue_poll) => {}
                    }
                }
                Err(e) => {
                    warn!("worker {}: broker error: {}", index, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.dequeue_poll) => {}
                    }
                }
            }
        }
        info!("worker {} stopped", index);
    }

    /// Dequeue and handle one job; returns whether a job was available
    pub async fn handle_next(&self) -> Result<bool, BrokerError> {
        let Some(delivered) = self.broker.dequeue().await? else {
            return Ok(false);
        };
        self.handle_delivery(delivered).await;
        Ok(true)
    }

    async fn handle_delivery(&self, delivered: DeliveredJob) {
        match delivered.envelope.payload.clone() {
            JobPayload::Coordinator {
                project_id,
                task_ids,
            } => {
                self.handle_coordinator(&delivered, project_id, task_ids)
                    .await
            }
            JobPayload::MatchEntry {
                project_id,
                task_ids,
            } => {
                self.handle_match_batch(&delivered, project_id, &task_ids)
                    .await
            }
        }
    }

    async fn handle_coordinator(
        &self,
        delivered: &DeliveredJob,
        project_id: Uuid,
        task_ids: Option<Vec<Uuid>>,
    ) {
        match self.coordinator.run(project_id, task_ids.as_deref()).await {
            Ok(outcome) => {
                debug!("coordinator job for project {}: {:?}", project_id, outcome);
                self.ack(delivered).await;
            }
            // coordinator failures are all transient
            Err(e) => {
                self.retry_or_dead_letter(delivered, &e.to_string(), None)
                    .await;
            }
        }
    }

    async fn handle_match_batch(
        &self,
        delivered: &DeliveredJob,
        project_id: Uuid,
        task_ids: &[Uuid],
    ) {
        for task_id in task_ids {
            match self.process_task(*task_id).await {
                Ok(()) => {}
                Err(e) if e.is_permanent() => {
                    // this task fails; the rest of the batch still runs
                    self.fail_task(*task_id, project_id, &e.to_string()).await;
                }
                Err(e) => {
                    let dead_lettered = self
                        .retry_or_dead_letter(delivered, &e.to_string(), Some((*task_id, project_id)))
                        .await;
                    if dead_lettered {
                        // the batch is over; a roll-up may now be due
                        self.maybe_completion_check(project_id).await;
                    }
                    return;
                }
            }
        }
        self.ack(delivered).await;
        self.maybe_completion_check(project_id).await;
    }

    /// Per-task contract: refetch, claim, match
    async fn process_task(&self, task_id: Uuid) -> Result<(), MatcherError> {
        let Some(task) = db::tasks::get_task(&self.db, task_id).await? else {
            debug!("task {} missing, skipping", task_id);
            return Ok(());
        };

        match task.status {
            TaskStatus::QueuedForProcessing => {
                let rows = db::tasks::conditional_update_task_status(
                    &self.db,
                    task_id,
                    TaskStatus::QueuedForProcessing,
                    TaskStatus::Processing,
                )
                .await?;
                if rows == 0 {
                    debug!("task {}: lost the claim race, skipping", task_id);
                    return Ok(());
                }
            }
            // stale redelivery of a claimed task proceeds without a claim;
            // the final conditional write picks the winner
            TaskStatus::Processing => {}
            status => {
                debug!("task {}: already {}, skipping", task_id, status);
                return Ok(());
            }
        }

        match self.matcher.run(&task).await? {
            MatchOutcome::Completed {
                status,
                candidate_count,
                highest_score,
            } => {
                debug!("task {} settled to {}", task_id, status);
                self.event_bus.emit_lossy(RelinkEvent::TaskMatched {
                    task_id,
                    project_id: task.project_id,
                    candidate_count,
                    highest_score,
                    timestamp: relink_common::time::now(),
                });
            }
            MatchOutcome::Superseded => {
                debug!("task {}: superseded, result dropped", task_id);
            }
        }
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, project_id: Uuid, message: &str) {
        warn!("task {}: permanent failure: {}", task_id, message);
        match db::tasks::mark_task_failed(&self.db, task_id, message).await {
            Ok(rows) if rows > 0 => {
                self.event_bus.emit_lossy(RelinkEvent::TaskFailed {
                    task_id,
                    project_id,
                    message: message.to_string(),
                    timestamp: relink_common::time::now(),
                });
            }
            // settled elsewhere in the meantime
            Ok(_) => {}
            Err(e) => warn!("task {}: could not record failure: {}", task_id, e),
        }
    }

    /// Returns whether the job was dead-lettered (attempt budget spent)
    async fn retry_or_dead_letter(
        &self,
        delivered: &DeliveredJob,
        error: &str,
        current_task: Option<(Uuid, Uuid)>,
    ) -> bool {
        let envelope = &delivered.envelope;
        if envelope.is_final_attempt() {
            warn!(
                "job {}: attempts exhausted ({}/{}): {}",
                envelope.job_id,
                envelope.attempt + 1,
                envelope.max_attempts,
                error
            );
            if let Some((task_id, project_id)) = current_task {
                // the task the batch died on must not stay in flight
                self.fail_task(task_id, project_id, error).await;
            }
            if let Err(e) = self.broker.dead_letter(delivered, error).await {
                warn!("job {}: dead-letter failed: {}", envelope.job_id, e);
                return false;
            }
            self.event_bus.emit_lossy(RelinkEvent::JobDeadLettered {
                job_id: envelope.job_id,
                job_type: envelope.job_type().to_string(),
                timestamp: relink_common::time::now(),
            });
            true
        } else {
            let delay = backoff_delay(
                self.backoff_base_secs,
                envelope.attempt,
                self.backoff_cap_secs,
            );
            info!(
                "job {}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                envelope.job_id,
                envelope.attempt + 1,
                envelope.max_attempts,
                delay,
                error
            );
            if let Err(e) = self.broker.nack(delivered, delay).await {
                warn!("job {}: nack failed: {}", envelope.job_id, e);
            }
            false
        }
    }

    /// Batch finished: enqueue a completion check iff nothing is left in
    /// flight. The sweeper re-triggers the check if this enqueue is lost.
    async fn maybe_completion_check(&self, project_id: Uuid) {
        match db::tasks::count_unfinished_tasks(&self.db, project_id).await {
            Ok(0) => {
                if let Err(e) = self.dispatcher.enqueue_coordinator(project_id, None).await {
                    warn!(
                        "project {}: completion check enqueue failed: {}",
                        project_id, e
                    );
                }
            }
            Ok(remaining) => {
                debug!("project {}: {} tasks still unfinished", project_id, remaining)
            }
            Err(e) => warn!("project {}: unfinished count failed: {}", project_id, e),
        }
    }

    async fn ack(&self, delivered: &DeliveredJob) {
        if let Err(e) = self.broker.ack(delivered).await {
            warn!("job {}: ack failed: {}", delivered.envelope.job_id, e);
        }
    }
}

fn backoff_delay(base_secs: u64, attempt: u32, cap_secs: u64) -> Duration {
    let raw = base_secs.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_secs(raw.min(cap_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, ScoringConfig};
    use crate::db::entries::NewEntry;
    use crate::db::queue::SqliteBroker;
    use crate::models::ProjectStatus;
    use crate::services::wikidata_client::{EntitySnapshot, SearchClient, SearchError};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    struct ScriptedSearch {
        responses: Mutex<VecDeque<Result<Vec<EntitySnapshot>, SearchError>>>,
    }

    impl ScriptedSearch {
        fn new(scripted: Vec<Result<Vec<EntitySnapshot>, SearchError>>) -> Arc<Self> {
            Arc::new(ScriptedSearch {
                responses: Mutex::new(scripted.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl SearchClient for ScriptedSearch {
        async fn search(&self, _query: &str) -> Result<Vec<EntitySnapshot>, SearchError> {
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn snapshot(id: &str, label: &str) -> EntitySnapshot {
        EntitySnapshot {
            id: id.to_string(),
            label: Some(label.to_string()),
            description: None,
            aliases: Vec::new(),
            claims: BTreeMap::new(),
        }
    }

    struct Harness {
        pool: SqlitePool,
        broker: Arc<SqliteBroker>,
        worker: WorkerPool,
        event_bus: EventBus,
    }

    fn pipeline_for_tests(max_attempts: u32) -> PipelineConfig {
        PipelineConfig {
            max_attempts,
            backoff_base_secs: 0,
            ..PipelineConfig::default()
        }
    }

    async fn harness(
        search: Arc<dyn SearchClient>,
        pipeline: PipelineConfig,
    ) -> Harness {
        let pool = db::test_pool().await;
        let broker = Arc::new(SqliteBroker::new(pool.clone(), Duration::ZERO));
        let dispatcher = JobDispatcher::new(broker.clone(), pipeline.max_attempts);
        let event_bus = EventBus::new(64);
        let matcher = Matcher::new(pool.clone(), search, ScoringConfig::default());
        let coordinator = Coordinator::new(
            pool.clone(),
            dispatcher.clone(),
            event_bus.clone(),
            pipeline.chunk_size,
        );
        let worker = WorkerPool::new(
            pool.clone(),
            broker.clone(),
            dispatcher,
            matcher,
            coordinator,
            event_bus.clone(),
            &pipeline,
        );
        Harness {
            pool,
            broker,
            worker,
            event_bus,
        }
    }

    /// Project with `names` ingested, started, and fanned out by a real
    /// coordinator run; returns (project_id, task_ids in batch order)
    async fn seed_fanned_out(h: &Harness, names: &[&str]) -> (Uuid, Vec<Uuid>) {
        let project = db::projects::create_project(&h.pool, "import", None, None)
            .await
            .expect("project");
        let entries: Vec<NewEntry> = names
            .iter()
            .map(|name| NewEntry {
                display_name: name.to_string(),
                attributes: Default::default(),
                external_ref: None,
            })
            .collect();
        let entry_ids = db::entries::insert_entries(&h.pool, project.id, &entries)
            .await
            .expect("entries");
        db::tasks::create_tasks_for_entries(&h.pool, project.id, &entry_ids)
            .await
            .expect("tasks");
        for (from, to) in [
            (ProjectStatus::Draft, ProjectStatus::Active),
            (ProjectStatus::Active, ProjectStatus::PendingSearch),
        ] {
            db::projects::conditional_update_project_status(&h.pool, project.id, from, to)
                .await
                .expect("walk");
        }
        // coordinator job through the real queue
        h.worker
            .dispatcher
            .enqueue_coordinator(project.id, None)
            .await
            .expect("enqueue");
        assert!(h.worker.handle_next().await.expect("coordinator run"));
        let task_ids = db::tasks::task_ids_with_status(
            &h.pool,
            project.id,
            TaskStatus::QueuedForProcessing,
        )
        .await
        .expect("ids");
        (project.id, task_ids)
    }

    async fn drain(h: &Harness) {
        while h.worker.handle_next().await.expect("handle") {}
    }

    fn collect_events(rx: &mut tokio::sync::broadcast::Receiver<RelinkEvent>) -> Vec<RelinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_batch_runs_to_project_roll_up() {
        let search = ScriptedSearch::new(vec![
            Ok(vec![snapshot("Q1", "Alice Example")]),
            Ok(vec![snapshot("Q2", "Bob Example")]),
        ]);
        let h = harness(search, pipeline_for_tests(3)).await;
        let mut rx = h.event_bus.subscribe();

        let (project_id, task_ids) = seed_fanned_out(&h, &["Alice Example", "Bob Example"]).await;
        drain(&h).await;

        for task_id in &task_ids {
            let task = db::tasks::get_task(&h.pool, *task_id)
                .await
                .expect("get")
                .expect("task");
            assert_eq!(task.status, TaskStatus::AwaitingReview);
            assert_eq!(task.candidate_count, 1);
        }
        let project = db::projects::get_project(&h.pool, project_id)
            .await
            .expect("get")
            .expect("project");
        assert_eq!(project.status, ProjectStatus::ReviewReady);
        assert_eq!(h.broker.queued_depth().await.expect("depth"), 0);

        let events = collect_events(&mut rx);
        let matched = events
            .iter()
            .filter(|e| matches!(e, RelinkEvent::TaskMatched { .. }))
            .count();
        assert_eq!(matched, 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, RelinkEvent::ProjectRollup { status, .. } if status == "review_ready")));
    }

    #[tokio::test]
    async fn test_permanent_failure_continues_batch() {
        // first task in the batch hits a permanent error; the second runs
        let search = ScriptedSearch::new(vec![
            Err(SearchError::Api {
                status: 404,
                message: "Not Found".to_string(),
            }),
            Ok(Vec::new()),
        ]);
        let h = harness(search, pipeline_for_tests(3)).await;

        let (project_id, task_ids) =
            seed_fanned_out(&h, &["Alice Example", "Bob Example"]).await;
        drain(&h).await;

        let first = db::tasks::get_task(&h.pool, task_ids[0])
            .await
            .expect("get")
            .expect("task");
        assert_eq!(first.status, TaskStatus::Failed);
        assert!(first
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("404"));

        let second = db::tasks::get_task(&h.pool, task_ids[1])
            .await
            .expect("get")
            .expect("task");
        assert_eq!(second.status, TaskStatus::NoCandidatesFound);
        assert_eq!(h.broker.dead_letter_count().await.expect("dlq"), 0);

        // a failed task rolls the project into processing_failed
        let project = db::projects::get_project(&h.pool, project_id)
            .await
            .expect("get")
            .expect("project");
        assert_eq!(project.status, ProjectStatus::ProcessingFailed);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_and_recovers() {
        let search = ScriptedSearch::new(vec![
            Err(SearchError::Timeout),
            Ok(vec![snapshot("Q1", "Alice Example")]),
        ]);
        let h = harness(search, pipeline_for_tests(3)).await;

        let (project_id, task_ids) = seed_fanned_out(&h, &["Alice Example"]).await;
        drain(&h).await;

        let task = db::tasks::get_task(&h.pool, task_ids[0])
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert_eq!(task.highest_score, Some(100));
        assert_eq!(h.broker.dead_letter_count().await.expect("dlq"), 0);

        let project = db::projects::get_project(&h.pool, project_id)
            .await
            .expect("get")
            .expect("project");
        assert_eq!(project.status, ProjectStatus::ReviewReady);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_the_batch() {
        let search = ScriptedSearch::new(vec![Err(SearchError::Timeout)]);
        // budget of one delivery: first transient failure is final
        let h = harness(search, pipeline_for_tests(1)).await;
        let mut rx = h.event_bus.subscribe();

        let (project_id, task_ids) = seed_fanned_out(&h, &["Alice Example"]).await;
        drain(&h).await;

        let task = db::tasks::get_task(&h.pool, task_ids[0])
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(h.broker.dead_letter_count().await.expect("dlq"), 1);

        let events = collect_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, RelinkEvent::JobDeadLettered { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RelinkEvent::TaskFailed { .. })));

        // failing the task unblocked the roll-up
        let project = db::projects::get_project(&h.pool, project_id)
            .await
            .expect("get")
            .expect("project");
        assert_eq!(project.status, ProjectStatus::ProcessingFailed);
    }

    #[tokio::test]
    async fn test_duplicate_batch_delivery_adds_nothing() {
        let search = ScriptedSearch::new(vec![Ok(vec![snapshot("Q1", "Alice Example")])]);
        let h = harness(search, pipeline_for_tests(3)).await;

        let (project_id, task_ids) = seed_fanned_out(&h, &["Alice Example"]).await;
        drain(&h).await;

        // duplicate of the already-finished batch arrives later
        h.worker
            .dispatcher
            .enqueue_match_batch(project_id, task_ids.clone())
            .await
            .expect("enqueue duplicate");
        drain(&h).await;

        let task = db::tasks::get_task(&h.pool, task_ids[0])
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert_eq!(task.candidate_count, 1);
        let candidates = db::candidates::list_candidates_for_task(&h.pool, task_ids[0])
            .await
            .expect("list");
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_obsolete_coordinator_job_is_acked() {
        let search = ScriptedSearch::new(vec![]);
        let h = harness(search, pipeline_for_tests(3)).await;

        let project = db::projects::create_project(&h.pool, "import", None, None)
            .await
            .expect("project");
        db::projects::conditional_update_project_status(
            &h.pool,
            project.id,
            ProjectStatus::Draft,
            ProjectStatus::Archived,
        )
        .await
        .expect("archive");

        h.worker
            .dispatcher
            .enqueue_coordinator(project.id, None)
            .await
            .expect("enqueue");
        assert!(h.worker.handle_next().await.expect("handle"));
        assert_eq!(h.broker.queued_depth().await.expect("depth"), 0);
        assert_eq!(h.broker.dead_letter_count().await.expect("dlq"), 0);
    }
}
