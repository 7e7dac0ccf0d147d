//! Matcher: per-task match computation
//!
//! Runs against a task already claimed to `processing`: load the entry,
//! query the knowledge base, score every snapshot, persist candidates and
//! the task outcome in one transaction. A zero-row task update means
//! another writer settled the task first; the whole result is dropped.

use crate::config::ScoringConfig;
use crate::db;
use crate::db::candidates::{AcceptWrite, NewCandidate};
use crate::models::{CandidateSource, CandidateStatus, Task, TaskStatus};
use crate::services::scoring::score_candidate;
use crate::services::wikidata_client::{SearchClient, SearchError};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Matcher errors; `is_permanent` drives the worker's retry decision
#[derive(Debug, Error)]
pub enum MatcherError {
    /// Task references an entry that no longer exists
    #[error("entry {0} not found")]
    EntryMissing(Uuid),

    /// Project row vanished mid-flight
    #[error("project {0} not found")]
    ProjectMissing(Uuid),

    /// Project scoring override JSON does not parse
    #[error("invalid scoring override: {0}")]
    InvalidScoringOverride(String),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Db(#[from] relink_common::Error),
}

impl MatcherError {
    pub fn is_permanent(&self) -> bool {
        match self {
            MatcherError::EntryMissing(_)
            | MatcherError::ProjectMissing(_)
            | MatcherError::InvalidScoringOverride(_) => true,
            MatcherError::Search(e) => e.is_permanent(),
            // DB failures retry; persistent ones exhaust the attempt budget
            MatcherError::Db(_) => false,
        }
    }
}

/// Result of one match computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Task settled into a match state
    Completed {
        status: TaskStatus,
        candidate_count: i64,
        highest_score: Option<i64>,
    },
    /// Another writer settled the task first; result dropped
    Superseded,
}

pub struct Matcher {
    db: SqlitePool,
    search: Arc<dyn SearchClient>,
    scoring: ScoringConfig,
}

impl Matcher {
    pub fn new(db: SqlitePool, search: Arc<dyn SearchClient>, scoring: ScoringConfig) -> Self {
        Matcher {
            db,
            search,
            scoring,
        }
    }

    /// Compute and persist match candidates for a claimed task
    pub async fn run(&self, task: &Task) -> Result<MatchOutcome, MatcherError> {
        let entry = db::entries::get_entry(&self.db, task.entry_id)
            .await?
            .ok_or(MatcherError::EntryMissing(task.entry_id))?;

        let scoring = self.project_scoring(task.project_id).await?;

        let snapshots = self.search.search(&entry.display_name).await?;
        debug!(
            "task {}: {} snapshots for '{}'",
            task.id,
            snapshots.len(),
            entry.display_name
        );

        let candidates: Vec<NewCandidate> = snapshots
            .iter()
            .map(|snapshot| {
                let scored = score_candidate(&entry, snapshot, &scoring);
                NewCandidate {
                    entity_id: snapshot.id.clone(),
                    label: snapshot.label.clone(),
                    description: snapshot.description.clone(),
                    score: scored.score,
                    score_breakdown: serde_json::to_value(&scored.breakdown).ok(),
                    source: CandidateSource::AutomatedSearch,
                }
            })
            .collect();

        let Some(completion) =
            db::tasks::complete_task_with_candidates(&self.db, task.id, &candidates).await?
        else {
            debug!("task {}: settled elsewhere, dropping result", task.id);
            return Ok(MatchOutcome::Superseded);
        };

        let mut status = completion.status;
        if status == TaskStatus::AwaitingReview {
            if let Some(threshold) = scoring.auto_accept_threshold {
                if self.try_auto_accept(task.id, threshold).await? {
                    status = TaskStatus::AutoConfirmed;
                }
            }
        }

        Ok(MatchOutcome::Completed {
            status,
            candidate_count: completion.candidate_count,
            highest_score: completion.highest_score,
        })
    }

    async fn project_scoring(&self, project_id: Uuid) -> Result<ScoringConfig, MatcherError> {
        let project = db::projects::get_project(&self.db, project_id)
            .await?
            .ok_or(MatcherError::ProjectMissing(project_id))?;
        match project.scoring_config {
            Some(value) => self
                .scoring
                .with_overrides(&value)
                .map_err(|e| MatcherError::InvalidScoringOverride(e.to_string())),
            None => Ok(self.scoring.clone()),
        }
    }

    /// Accept the top candidate when it clears the threshold and no other
    /// candidate ties its score. Returns whether the accept landed.
    async fn try_auto_accept(&self, task_id: Uuid, threshold: i64) -> Result<bool, MatcherError> {
        let candidates = db::candidates::list_candidates_for_task(&self.db, task_id).await?;
        let Some(top) = candidates.first() else {
            return Ok(false);
        };
        if top.score < threshold {
            return Ok(false);
        }
        if candidates.iter().filter(|c| c.score == top.score).count() > 1 {
            debug!("task {}: tied top score, leaving for review", task_id);
            return Ok(false);
        }

        let write = AcceptWrite {
            candidate_id: top.id,
            expected_candidate_status: CandidateStatus::Suggested,
            accepted_entity_id: top.entity_id.clone(),
            task_id,
            expected_task_status: TaskStatus::AwaitingReview,
            new_task_status: Some(TaskStatus::AutoConfirmed),
            demote_candidate_id: None,
        };
        let accepted = db::candidates::accept_candidate(&self.db, &write).await?;
        if accepted {
            info!(
                "task {}: auto-accepted {} (score {})",
                task_id, top.entity_id, top.score
            );
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entries::NewEntry;
    use crate::services::wikidata_client::EntitySnapshot;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    struct ScriptedSearch {
        responses: Mutex<VecDeque<Result<Vec<EntitySnapshot>, SearchError>>>,
    }

    impl ScriptedSearch {
        fn returning(results: Vec<Vec<EntitySnapshot>>) -> Arc<Self> {
            Arc::new(ScriptedSearch {
                responses: Mutex::new(results.into_iter().map(Ok).collect()),
            })
        }

        fn failing(error: SearchError) -> Arc<Self> {
            Arc::new(ScriptedSearch {
                responses: Mutex::new(VecDeque::from([Err(error)])),
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

    fn snapshot(id: &str, label: &str, dob: Option<&str>) -> EntitySnapshot {
        let mut claims = BTreeMap::new();
        if let Some(dob) = dob {
            claims.insert("P569".to_string(), dob.to_string());
        }
        EntitySnapshot {
            id: id.to_string(),
            label: Some(label.to_string()),
            description: None,
            aliases: Vec::new(),
            claims,
        }
    }

    /// Project + one entry + one task claimed to `processing`
    async fn seed_claimed_task(pool: &SqlitePool) -> Task {
        let project = db::projects::create_project(pool, "import", None, None)
            .await
            .expect("project");
        let entries = db::entries::insert_entries(
            pool,
            project.id,
            &[NewEntry {
                display_name: "Wayne Gretzky".to_string(),
                attributes: BTreeMap::from([(
                    "date_of_birth".to_string(),
                    "1961-01-26".to_string(),
                )]),
                external_ref: None,
            }],
        )
        .await
        .expect("entries");
        db::tasks::create_tasks_for_entries(pool, project.id, &entries)
            .await
            .expect("tasks");
        let task_ids = db::tasks::task_ids_with_status(pool, project.id, TaskStatus::New)
            .await
            .expect("ids");
        let task_id = task_ids[0];
        db::tasks::conditional_update_task_status(
            pool,
            task_id,
            TaskStatus::New,
            TaskStatus::QueuedForProcessing,
        )
        .await
        .expect("queue");
        db::tasks::conditional_update_task_status(
            pool,
            task_id,
            TaskStatus::QueuedForProcessing,
            TaskStatus::Processing,
        )
        .await
        .expect("claim");
        db::tasks::get_task(pool, task_id)
            .await
            .expect("get")
            .expect("task")
    }

    #[tokio::test]
    async fn test_match_persists_candidates_and_settles_task() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;

        let search = ScriptedSearch::returning(vec![vec![
            snapshot("Q231480", "Wayne Gretzky", Some("+1961-01-26T00:00:00Z")),
            snapshot("Q3564870", "Walter Gretzky", Some("+1938-10-08T00:00:00Z")),
        ]]);
        let matcher = Matcher::new(pool.clone(), search, ScoringConfig::default());

        let outcome = matcher.run(&task).await.expect("run");
        assert_eq!(
            outcome,
            MatchOutcome::Completed {
                status: TaskStatus::AwaitingReview,
                candidate_count: 2,
                highest_score: Some(100),
            }
        );

        let stored = db::candidates::list_candidates_for_task(&pool, task.id)
            .await
            .expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].entity_id, "Q231480");
        assert_eq!(stored[0].score, 100);
        assert!(stored[0].score_breakdown.is_some());
        assert_eq!(stored[0].source, CandidateSource::AutomatedSearch);

        let task = db::tasks::get_task(&pool, task.id)
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert_eq!(task.candidate_count, 2);
        assert!(task.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_empty_search_yields_no_candidates_found() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;

        let search = ScriptedSearch::returning(vec![Vec::new()]);
        let matcher = Matcher::new(pool.clone(), search, ScoringConfig::default());

        let outcome = matcher.run(&task).await.expect("run");
        assert_eq!(
            outcome,
            MatchOutcome::Completed {
                status: TaskStatus::NoCandidatesFound,
                candidate_count: 0,
                highest_score: None,
            }
        );
    }

    #[tokio::test]
    async fn test_missing_entry_is_permanent() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;
        // entry row vanished underneath the claimed task (external damage;
        // FK enforcement has to be off to fake it)
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&pool)
            .await
            .expect("pragma");
        sqlx::query("DELETE FROM entries WHERE id = ?")
            .bind(task.entry_id.to_string())
            .execute(&pool)
            .await
            .expect("delete entry");

        let search = ScriptedSearch::returning(vec![]);
        let matcher = Matcher::new(pool.clone(), search, ScoringConfig::default());

        let err = matcher.run(&task).await.expect_err("missing entry");
        assert!(matches!(err, MatcherError::EntryMissing(id) if id == task.entry_id));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_search_error_propagates_as_transient() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;

        let search = ScriptedSearch::failing(SearchError::Timeout);
        let matcher = Matcher::new(pool.clone(), search, ScoringConfig::default());

        let err = matcher.run(&task).await.expect_err("timeout");
        assert!(!err.is_permanent());
        // nothing persisted
        let stored = db::candidates::list_candidates_for_task(&pool, task.id)
            .await
            .expect("list");
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_when_task_left_processing() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;
        // another writer settles the task while this worker is matching
        db::tasks::conditional_update_task_status(
            &pool,
            task.id,
            TaskStatus::Processing,
            TaskStatus::Failed,
        )
        .await
        .expect("settle");

        let search = ScriptedSearch::returning(vec![vec![snapshot(
            "Q231480",
            "Wayne Gretzky",
            None,
        )]]);
        let matcher = Matcher::new(pool.clone(), search, ScoringConfig::default());

        let outcome = matcher.run(&task).await.expect("run");
        assert_eq!(outcome, MatchOutcome::Superseded);
        let stored = db::candidates::list_candidates_for_task(&pool, task.id)
            .await
            .expect("list");
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_auto_accept_unambiguous_top_candidate() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;

        let search = ScriptedSearch::returning(vec![vec![
            snapshot("Q231480", "Wayne Gretzky", Some("+1961-01-26T00:00:00Z")),
            snapshot("Q3564870", "Walter Gretzky", Some("+1938-10-08T00:00:00Z")),
        ]]);
        let scoring = ScoringConfig {
            auto_accept_threshold: Some(95),
            ..ScoringConfig::default()
        };
        let matcher = Matcher::new(pool.clone(), search, scoring);

        let outcome = matcher.run(&task).await.expect("run");
        assert!(matches!(
            outcome,
            MatchOutcome::Completed {
                status: TaskStatus::AutoConfirmed,
                ..
            }
        ));

        let task = db::tasks::get_task(&pool, task.id)
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::AutoConfirmed);
        assert_eq!(task.accepted_entity_id.as_deref(), Some("Q231480"));
        assert!(task.accepted_candidate_id.is_some());
    }

    #[tokio::test]
    async fn test_auto_accept_skipped_on_tied_scores() {
        let pool = db::test_pool().await;
        let task = seed_claimed_task(&pool).await;

        // two entities with identical labels score identically
        let search = ScriptedSearch::returning(vec![vec![
            snapshot("Q231480", "Wayne Gretzky", Some("+1961-01-26T00:00:00Z")),
            snapshot("Q999999", "Wayne Gretzky", Some("+1961-01-26T00:00:00Z")),
        ]]);
        let scoring = ScoringConfig {
            auto_accept_threshold: Some(95),
            ..ScoringConfig::default()
        };
        let matcher = Matcher::new(pool.clone(), search, scoring);

        let outcome = matcher.run(&task).await.expect("run");
        assert!(matches!(
            outcome,
            MatchOutcome::Completed {
                status: TaskStatus::AwaitingReview,
                ..
            }
        ));

        let task = db::tasks::get_task(&pool, task.id)
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert!(task.accepted_candidate_id.is_none());
    }
}
