//! Task review endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::db::candidates::NewCandidate;
use crate::error::{ApiError, ApiResult};
use crate::models::{Candidate, CandidateSource, Task, TaskStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ManualCandidateRequest {
    pub entity_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to 0 when omitted
    #[serde(default)]
    pub score: Option<i64>,
}

async fn load_task(db: &sqlx::SqlitePool, id: Uuid) -> ApiResult<Task> {
    db::tasks::get_task(db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {}", id)))
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    Ok(Json(load_task(&state.db, id).await?))
}

/// POST /api/tasks/:id/skip
pub async fn skip_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    let task = load_task(&state.db, id).await?;
    task.status.ensure_transition(TaskStatus::Skipped)?;

    let rows =
        db::tasks::conditional_settle_task(&state.db, id, task.status, TaskStatus::Skipped).await?;
    if rows == 0 {
        return Err(ApiError::Conflict("task status changed concurrently".to_string()));
    }
    info!("task {} skipped", id);
    Ok(Json(load_task(&state.db, id).await?))
}

/// POST /api/tasks/:id/knowledge-based
pub async fn mark_knowledge_based(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    let task = load_task(&state.db, id).await?;
    task.status.ensure_transition(TaskStatus::KnowledgeBased)?;

    let rows =
        db::tasks::conditional_settle_task(&state.db, id, task.status, TaskStatus::KnowledgeBased)
            .await?;
    if rows == 0 {
        return Err(ApiError::Conflict("task status changed concurrently".to_string()));
    }
    info!("task {} marked knowledge-based", id);
    Ok(Json(load_task(&state.db, id).await?))
}

/// GET /api/tasks/:id/candidates
pub async fn list_candidates(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Candidate>>> {
    load_task(&state.db, id).await?;
    let candidates = db::candidates::list_candidates_for_task(&state.db, id).await?;
    Ok(Json(candidates))
}

/// POST /api/tasks/:id/candidates
///
/// Reviewer-supplied candidate. Allowed only in the review statuses the
/// API may touch, awaiting_review and no_candidates_found.
pub async fn add_candidate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ManualCandidateRequest>,
) -> ApiResult<(StatusCode, Json<Candidate>)> {
    let task = load_task(&state.db, id).await?;

    if request.entity_id.trim().is_empty() {
        return Err(ApiError::BadRequest("entity_id must not be blank".to_string()));
    }
    let score = request.score.unwrap_or(0);
    if !(0..=100).contains(&score) {
        return Err(ApiError::BadRequest("score must be between 0 and 100".to_string()));
    }
    if !matches!(
        task.status,
        TaskStatus::AwaitingReview | TaskStatus::NoCandidatesFound
    ) {
        return Err(ApiError::Conflict(format!(
            "candidates cannot be added while the task is '{}'",
            task.status
        )));
    }

    let candidate = db::candidates::add_manual_candidate(
        &state.db,
        id,
        &NewCandidate {
            entity_id: request.entity_id.trim().to_string(),
            label: request.label,
            description: request.description,
            score,
            score_breakdown: None,
            source: CandidateSource::Manual,
        },
    )
    .await?;

    info!("task {}: manual candidate {} added", id, candidate.id);
    Ok((StatusCode::CREATED, Json(candidate)))
}

/// Build task routes
pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/skip", post(skip_task))
        .route("/api/tasks/:id/knowledge-based", post(mark_knowledge_based))
        .route(
            "/api/tasks/:id/candidates",
            get(list_candidates).post(add_candidate),
        )
}
