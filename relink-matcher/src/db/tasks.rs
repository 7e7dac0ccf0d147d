//! Task persistence
//!
//! Every pipeline-side status write is conditional on the expected prior
//! status. A zero-row result is the optimistic-concurrency signal: the task
//! changed underneath the writer and the write must be dropped, never
//! retried blindly.

use crate::db::candidates::{insert_candidate_conn, NewCandidate};
use crate::models::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use relink_common::{time, uuid_utils, Result};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Outcome of a successful `complete_task_with_candidates` write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub status: TaskStatus,
    pub candidate_count: i64,
    pub highest_score: Option<i64>,
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let entry_id: String = row.get("entry_id");
    let status: String = row.get("status");
    let accepted_candidate_id: Option<String> = row.get("accepted_candidate_id");
    let processed_at: Option<String> = row.get("processed_at");
    let reviewed_at: Option<String> = row.get("reviewed_at");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Task {
        id: uuid_utils::parse(&id)?,
        project_id: uuid_utils::parse(&project_id)?,
        entry_id: uuid_utils::parse(&entry_id)?,
        status: status.parse()?,
        accepted_candidate_id: uuid_utils::parse_opt(accepted_candidate_id.as_deref())?,
        accepted_entity_id: row.get("accepted_entity_id"),
        candidate_count: row.get("candidate_count"),
        highest_score: row.get("highest_score"),
        error_message: row.get("error_message"),
        processed_at: time::parse_opt_db_timestamp(processed_at.as_deref())?,
        reviewed_at: time::parse_opt_db_timestamp(reviewed_at.as_deref())?,
        created_at: time::parse_db_timestamp(&created_at)?,
        updated_at: time::parse_db_timestamp(&updated_at)?,
    })
}

/// Create `new` tasks for the given entries, skipping entries that already
/// have one (UNIQUE(project_id, entry_id)). Returns the number created.
pub async fn create_tasks_for_entries(
    pool: &SqlitePool,
    project_id: Uuid,
    entry_ids: &[Uuid],
) -> Result<u64> {
    let now_str = time::now_db_timestamp();
    let project_id_str = project_id.to_string();
    let mut created = 0u64;

    let mut tx = pool.begin().await?;
    for entry_id in entry_ids {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks (id, project_id, entry_id, status, created_at, updated_at)
            VALUES (?, ?, ?, 'new', ?, ?)
            "#,
        )
        .bind(uuid_utils::generate().to_string())
        .bind(&project_id_str)
        .bind(entry_id.to_string())
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;
        created += result.rows_affected();
    }
    tx.commit().await?;

    Ok(created)
}

pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

pub async fn list_tasks_for_project(
    pool: &SqlitePool,
    project_id: Uuid,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(
                "SELECT * FROM tasks WHERE project_id = ? AND status = ? ORDER BY created_at, id",
            )
            .bind(project_id.to_string())
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at, id")
                .bind(project_id.to_string())
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter().map(task_from_row).collect()
}

/// IDs of a project's tasks in one status, in a stable order
pub async fn task_ids_with_status(
    pool: &SqlitePool,
    project_id: Uuid,
    status: TaskStatus,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT id FROM tasks WHERE project_id = ? AND status = ? ORDER BY created_at, id",
    )
    .bind(project_id.to_string())
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| uuid_utils::parse(&row.get::<String, _>("id")))
        .collect()
}

/// Optimistic status write. 0 rows = the task left `expected` first.
pub async fn conditional_update_task_status(
    pool: &SqlitePool,
    id: Uuid,
    expected: TaskStatus,
    new: TaskStatus,
) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(new.as_str())
            .bind(time::now_db_timestamp())
            .bind(id.to_string())
            .bind(expected.as_str())
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

/// Review-action settle (skip / knowledge-based): conditional status write
/// that also records the decision time.
pub async fn conditional_settle_task(
    pool: &SqlitePool,
    id: Uuid,
    expected: TaskStatus,
    new: TaskStatus,
) -> Result<u64> {
    let now_str = time::now_db_timestamp();
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, reviewed_at = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(new.as_str())
    .bind(&now_str)
    .bind(&now_str)
    .bind(id.to_string())
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Mark a task failed with its error message. Conditional on the task still
/// being worker-owned; 0 rows if it already settled elsewhere.
pub async fn mark_task_failed(pool: &SqlitePool, id: Uuid, message: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET status = 'failed', error_message = ?, updated_at = ?
        WHERE id = ? AND status IN ('queued_for_processing', 'processing')
        "#,
    )
    .bind(message)
    .bind(time::now_db_timestamp())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Retry edge: failed → queued_for_processing, clearing the error and the
/// candidate denormalization for the fresh run.
pub async fn requeue_task_for_retry(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'queued_for_processing', error_message = NULL,
            candidate_count = 0, highest_score = NULL, updated_at = ?
        WHERE id = ? AND status = 'failed'
        "#,
    )
    .bind(time::now_db_timestamp())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Transactional matcher completion: insert the candidate rows, then
/// conditionally settle the task (expected `processing`). The
/// denormalized count and highest score are computed over all of the
/// task's candidates inside the transaction, so the highest-score
/// invariant holds even when rows existed beforehand.
///
/// Returns `None` when the task was no longer `processing`; the whole
/// transaction rolls back and no candidate row becomes visible.
pub async fn complete_task_with_candidates(
    pool: &SqlitePool,
    task_id: Uuid,
    candidates: &[NewCandidate],
) -> Result<Option<TaskCompletion>> {
    let now_str = time::now_db_timestamp();
    let task_id_str = task_id.to_string();

    let mut tx = pool.begin().await?;

    for candidate in candidates {
        insert_candidate_conn(&mut tx, task_id, candidate, &now_str).await?;
    }

    let candidate_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM candidates WHERE task_id = ?")
            .bind(&task_id_str)
            .fetch_one(&mut *tx)
            .await?;
    let highest_score: Option<i64> =
        sqlx::query_scalar("SELECT MAX(score) FROM candidates WHERE task_id = ?")
            .bind(&task_id_str)
            .fetch_one(&mut *tx)
            .await?;

    let status = if candidate_count > 0 {
        TaskStatus::AwaitingReview
    } else {
        TaskStatus::NoCandidatesFound
    };

    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = ?, candidate_count = ?, highest_score = ?,
            processed_at = ?, error_message = NULL, updated_at = ?
        WHERE id = ? AND status = 'processing'
        "#,
    )
    .bind(status.as_str())
    .bind(candidate_count)
    .bind(highest_score)
    .bind(&now_str)
    .bind(&now_str)
    .bind(&task_id_str)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }
    tx.commit().await?;

    Ok(Some(TaskCompletion {
        status,
        candidate_count,
        highest_score,
    }))
}

/// In-flight tasks whose last write predates `cutoff`, excluding
/// soft-deleted projects. Sweeper input.
pub async fn stale_inflight_tasks(
    pool: &SqlitePool,
    cutoff: &DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        r#"
        SELECT t.* FROM tasks t
        JOIN projects p ON p.id = t.project_id
        WHERE t.status IN ('queued_for_processing', 'processing')
          AND t.updated_at < ?
          AND p.soft_deleted = 0
        ORDER BY t.updated_at, t.id
        LIMIT ?
        "#,
    )
    .bind(time::to_db_timestamp(cutoff))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(task_from_row).collect()
}

/// Tasks still ahead of the pipeline: new, queued, or processing
pub async fn count_unfinished_tasks(pool: &SqlitePool, project_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM tasks
        WHERE project_id = ? AND status IN ('new', 'queued_for_processing', 'processing')
        "#,
    )
    .bind(project_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_tasks_with_status(
    pool: &SqlitePool,
    project_id: Uuid,
    status: TaskStatus,
) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE project_id = ? AND status = ?")
            .bind(project_id.to_string())
            .bind(status.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Per-status task counts for one project
pub async fn status_counts(pool: &SqlitePool, project_id: Uuid) -> Result<BTreeMap<String, i64>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM tasks WHERE project_id = ? GROUP BY status",
    )
    .bind(project_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
        .collect())
}
