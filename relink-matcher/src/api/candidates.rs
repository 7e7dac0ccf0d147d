//! Candidate accept/reject endpoints

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::db::candidates::AcceptWrite;
use crate::error::{ApiError, ApiResult};
use crate::models::{Candidate, CandidateStatus, Task, TaskStatus};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ReviewRequest {
    /// Required to move a candidate already in a terminal status
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub candidate: Candidate,
    pub task: Task,
}

async fn load_candidate(db: &sqlx::SqlitePool, id: Uuid) -> ApiResult<Candidate> {
    db::candidates::get_candidate(db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("candidate {}", id)))
}

async fn load_task(db: &sqlx::SqlitePool, id: Uuid) -> ApiResult<Task> {
    db::tasks::get_task(db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {}", id)))
}

/// POST /api/candidates/:id/accept
///
/// Settles the task on first accept. With `force`, re-targets a settled
/// task: the previously accepted candidate is demoted to rejected in the
/// same transaction and the task status is left alone.
pub async fn accept_candidate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReviewRequest>>,
) -> ApiResult<Json<ReviewResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let candidate = load_candidate(&state.db, id).await?;
    let task = load_task(&state.db, candidate.task_id).await?;

    candidate
        .status
        .ensure_transition(CandidateStatus::Accepted, request.force)?;

    let write = if matches!(task.status, TaskStatus::Reviewed | TaskStatus::AutoConfirmed) {
        if !request.force {
            return Err(ApiError::Conflict(
                "task already settled; pass force to re-target".to_string(),
            ));
        }
        AcceptWrite {
            candidate_id: candidate.id,
            expected_candidate_status: candidate.status,
            accepted_entity_id: candidate.entity_id.clone(),
            task_id: task.id,
            expected_task_status: task.status,
            new_task_status: None,
            demote_candidate_id: task.accepted_candidate_id,
        }
    } else {
        task.status.ensure_transition(TaskStatus::Reviewed)?;
        AcceptWrite {
            candidate_id: candidate.id,
            expected_candidate_status: candidate.status,
            accepted_entity_id: candidate.entity_id.clone(),
            task_id: task.id,
            expected_task_status: task.status,
            new_task_status: Some(TaskStatus::Reviewed),
            demote_candidate_id: None,
        }
    };

    if !db::candidates::accept_candidate(&state.db, &write).await? {
        return Err(ApiError::Conflict(
            "candidate or task changed concurrently".to_string(),
        ));
    }

    info!("candidate {} accepted for task {}", id, task.id);
    let candidate = load_candidate(&state.db, id).await?;
    let task = load_task(&state.db, write.task_id).await?;
    Ok(Json(ReviewResponse { candidate, task }))
}

/// POST /api/candidates/:id/reject
///
/// Plain reject leaves the task in awaiting_review. A forced reject of
/// the accepted candidate also clears the task's accepted refs.
pub async fn reject_candidate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReviewRequest>>,
) -> ApiResult<Json<ReviewResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let candidate = load_candidate(&state.db, id).await?;
    let task = load_task(&state.db, candidate.task_id).await?;

    candidate
        .status
        .ensure_transition(CandidateStatus::Rejected, request.force)?;

    if candidate.status == CandidateStatus::Accepted {
        let ok =
            db::candidates::reject_accepted_candidate(&state.db, candidate.id, task.id).await?;
        if !ok {
            return Err(ApiError::Conflict(
                "candidate changed concurrently".to_string(),
            ));
        }
    } else {
        let rows =
            db::candidates::reject_candidate(&state.db, candidate.id, candidate.status).await?;
        if rows == 0 {
            return Err(ApiError::Conflict(
                "candidate changed concurrently".to_string(),
            ));
        }
    }

    info!("candidate {} rejected for task {}", id, task.id);
    let candidate = load_candidate(&state.db, id).await?;
    let task = load_task(&state.db, task.id).await?;
    Ok(Json(ReviewResponse { candidate, task }))
}

/// Build candidate routes
pub fn candidate_routes() -> Router<AppState> {
    Router::new()
        .route("/api/candidates/:id/accept", post(accept_candidate))
        .route("/api/candidates/:id/reject", post(reject_candidate))
}
