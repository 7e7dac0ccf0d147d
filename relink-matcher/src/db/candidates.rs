//! Candidate persistence and the accept/reject transactions
//!
//! Accepting is the one write that touches two tables: the candidate row
//! and the owning task's review fields must move together or not at all.
//! Every branch is conditional on expected prior statuses, so concurrent
//! reviewers resolve to a single winner.

use crate::models::{Candidate, CandidateSource, CandidateStatus, TaskStatus};
use relink_common::{time, uuid_utils, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Fields for a candidate row about to be inserted
#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub entity_id: String,
    pub label: Option<String>,
    pub description: Option<String>,
    /// 0..=100
    pub score: i64,
    pub score_breakdown: Option<serde_json::Value>,
    pub source: CandidateSource,
}

fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Candidate> {
    let id: String = row.get("id");
    let task_id: String = row.get("task_id");
    let status: String = row.get("status");
    let source: String = row.get("source");
    let score_breakdown: Option<String> = row.get("score_breakdown");
    let score_breakdown: Option<serde_json::Value> = score_breakdown
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Candidate {
        id: uuid_utils::parse(&id)?,
        task_id: uuid_utils::parse(&task_id)?,
        entity_id: row.get("entity_id"),
        label: row.get("label"),
        description: row.get("description"),
        status: status.parse()?,
        source: source.parse()?,
        score: row.get("score"),
        score_breakdown,
        created_at: time::parse_db_timestamp(&created_at)?,
        updated_at: time::parse_db_timestamp(&updated_at)?,
    })
}

/// Insert one candidate row on an open connection/transaction
pub(crate) async fn insert_candidate_conn(
    conn: &mut sqlx::SqliteConnection,
    task_id: Uuid,
    candidate: &NewCandidate,
    now_str: &str,
) -> Result<Uuid> {
    let id = uuid_utils::generate();
    let breakdown_json = candidate.score_breakdown.as_ref().map(|v| v.to_string());

    sqlx::query(
        r#"
        INSERT INTO candidates (id, task_id, entity_id, label, description,
                                status, source, score, score_breakdown, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'suggested', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(task_id.to_string())
    .bind(&candidate.entity_id)
    .bind(&candidate.label)
    .bind(&candidate.description)
    .bind(candidate.source.as_str())
    .bind(candidate.score)
    .bind(&breakdown_json)
    .bind(now_str)
    .bind(now_str)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

pub async fn get_candidate(pool: &SqlitePool, id: Uuid) -> Result<Option<Candidate>> {
    let row = sqlx::query("SELECT * FROM candidates WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(candidate_from_row).transpose()
}

/// Candidates for one task, best score first
pub async fn list_candidates_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Candidate>> {
    let rows = sqlx::query(
        "SELECT * FROM candidates WHERE task_id = ? ORDER BY score DESC, created_at, id",
    )
    .bind(task_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(candidate_from_row).collect()
}

/// Everything the accept transaction needs to know up front
///
/// Expected statuses come from the caller's read; if any row moved in the
/// meantime the transaction rolls back and `accept_candidate` returns
/// false.
#[derive(Debug, Clone)]
pub struct AcceptWrite {
    pub candidate_id: Uuid,
    pub expected_candidate_status: CandidateStatus,
    /// External entity id denormalized onto the task
    pub accepted_entity_id: String,
    pub task_id: Uuid,
    pub expected_task_status: TaskStatus,
    /// `None` keeps the task status (re-targeting an already settled task)
    pub new_task_status: Option<TaskStatus>,
    /// Previously accepted candidate to demote in the same transaction
    pub demote_candidate_id: Option<Uuid>,
}

/// Accept a candidate and settle its task atomically. Returns false (and
/// writes nothing) when any conditional step misses.
pub async fn accept_candidate(pool: &SqlitePool, write: &AcceptWrite) -> Result<bool> {
    let now_str = time::now_db_timestamp();
    let mut tx = pool.begin().await?;

    if let Some(demote_id) = write.demote_candidate_id {
        let result = sqlx::query(
            "UPDATE candidates SET status = 'rejected', updated_at = ? WHERE id = ? AND status = 'accepted'",
        )
        .bind(&now_str)
        .bind(demote_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
    }

    let result = sqlx::query(
        "UPDATE candidates SET status = 'accepted', updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(&now_str)
    .bind(write.candidate_id.to_string())
    .bind(write.expected_candidate_status.as_str())
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    let result = match write.new_task_status {
        Some(new_status) => {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?, accepted_candidate_id = ?, accepted_entity_id = ?,
                    reviewed_at = ?, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(new_status.as_str())
            .bind(write.candidate_id.to_string())
            .bind(&write.accepted_entity_id)
            .bind(&now_str)
            .bind(&now_str)
            .bind(write.task_id.to_string())
            .bind(write.expected_task_status.as_str())
            .execute(&mut *tx)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                UPDATE tasks
                SET accepted_candidate_id = ?, accepted_entity_id = ?,
                    reviewed_at = ?, updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(write.candidate_id.to_string())
            .bind(&write.accepted_entity_id)
            .bind(&now_str)
            .bind(&now_str)
            .bind(write.task_id.to_string())
            .bind(write.expected_task_status.as_str())
            .execute(&mut *tx)
            .await?
        }
    };
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    tx.commit().await?;
    Ok(true)
}

/// Plain conditional reject for a not-yet-accepted candidate
pub async fn reject_candidate(
    pool: &SqlitePool,
    candidate_id: Uuid,
    expected: CandidateStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE candidates SET status = 'rejected', updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(time::now_db_timestamp())
    .bind(candidate_id.to_string())
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Forced reject of the currently accepted candidate. Clears the task's
/// accepted refs in the same transaction so they never dangle.
pub async fn reject_accepted_candidate(
    pool: &SqlitePool,
    candidate_id: Uuid,
    task_id: Uuid,
) -> Result<bool> {
    let now_str = time::now_db_timestamp();
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "UPDATE candidates SET status = 'rejected', updated_at = ? WHERE id = ? AND status = 'accepted'",
    )
    .bind(&now_str)
    .bind(candidate_id.to_string())
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE tasks
        SET accepted_candidate_id = NULL, accepted_entity_id = NULL, updated_at = ?
        WHERE id = ? AND accepted_candidate_id = ?
        "#,
    )
    .bind(&now_str)
    .bind(task_id.to_string())
    .bind(candidate_id.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Insert a caller-supplied candidate and refresh the task's
/// count/highest-score denormalization in the same transaction.
pub async fn add_manual_candidate(
    pool: &SqlitePool,
    task_id: Uuid,
    candidate: &NewCandidate,
) -> Result<Candidate> {
    let now_str = time::now_db_timestamp();
    let task_id_str = task_id.to_string();

    let mut tx = pool.begin().await?;
    let id = insert_candidate_conn(&mut tx, task_id, candidate, &now_str).await?;

    sqlx::query(
        r#"
        UPDATE tasks
        SET candidate_count = (SELECT COUNT(*) FROM candidates WHERE task_id = ?),
            highest_score = (SELECT MAX(score) FROM candidates WHERE task_id = ?),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&task_id_str)
    .bind(&task_id_str)
    .bind(&now_str)
    .bind(&task_id_str)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let now = time::parse_db_timestamp(&now_str)?;
    Ok(Candidate {
        id,
        task_id,
        entity_id: candidate.entity_id.clone(),
        label: candidate.label.clone(),
        description: candidate.description.clone(),
        status: CandidateStatus::Suggested,
        source: candidate.source,
        score: candidate.score,
        score_breakdown: candidate.score_breakdown.clone(),
        created_at: now,
        updated_at: now,
    })
}

/// Candidates of one task in `accepted` status; invariant checks expect
/// at most one.
pub async fn count_accepted_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM candidates WHERE task_id = ? AND status = 'accepted'",
    )
    .bind(task_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count)
}
