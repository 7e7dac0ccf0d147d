//! Project lifecycle endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScoringOverrides;
use crate::db;
use crate::db::entries::NewEntry;
use crate::error::{ApiError, ApiResult};
use crate::models::{Project, ProjectStatus, Task, TaskStatus};
use crate::AppState;
use relink_common::events::RelinkEvent;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Field-wise scoring override, validated at create time
    #[serde(default)]
    pub scoring_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct StartProjectResponse {
    pub project_id: Uuid,
    pub tasks_created: u64,
    pub tasks_existing: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunCriteria {
    Failed,
    NoCandidates,
    NoAccepted,
}

#[derive(Debug, Deserialize)]
pub struct RerunRequest {
    pub criteria: RerunCriteria,
}

#[derive(Debug, Serialize)]
pub struct RerunResponse {
    pub requeued: u64,
    /// Selected tasks whose status has no legal retry edge
    pub skipped: u64,
}

#[derive(Debug, Deserialize)]
pub struct IngestEntriesRequest {
    pub entries: Vec<NewEntry>,
}

#[derive(Debug, Serialize)]
pub struct IngestEntriesResponse {
    pub inserted: usize,
    pub entry_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProjectStatsResponse {
    pub project_id: Uuid,
    pub status: ProjectStatus,
    pub total_tasks: i64,
    pub by_status: BTreeMap<String, i64>,
    /// Tasks settled by review (reviewed, auto-confirmed, skipped,
    /// knowledge-based)
    pub reviewed_tasks: i64,
    pub review_progress: f64,
}

/// Soft-deleted projects are invisible to the API
async fn load_project(db: &sqlx::SqlitePool, id: Uuid) -> ApiResult<Project> {
    db::projects::get_project(db, id)
        .await?
        .filter(|p| !p.soft_deleted)
        .ok_or_else(|| ApiError::NotFound(format!("project {}", id)))
}

/// POST /api/projects
pub async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("project name must not be blank".to_string()));
    }
    if let Some(value) = &request.scoring_config {
        serde_json::from_value::<ScoringOverrides>(value.clone()).map_err(|e| {
            ApiError::BadRequest(format!("invalid scoring_config: {}", e))
        })?;
    }

    let project = db::projects::create_project(
        &state.db,
        name,
        request.description.as_deref(),
        request.scoring_config.as_ref(),
    )
    .await?;
    info!("created project {} '{}'", project.id, project.name);
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/projects/:id
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    Ok(Json(load_project(&state.db, id).await?))
}

/// POST /api/projects/:id/activate
pub async fn activate_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    let project = load_project(&state.db, id).await?;
    project.status.ensure_transition(ProjectStatus::Active)?;

    let rows = db::projects::conditional_update_project_status(
        &state.db,
        id,
        project.status,
        ProjectStatus::Active,
    )
    .await?;
    if rows == 0 {
        return Err(ApiError::Conflict("project status changed concurrently".to_string()));
    }
    Ok(Json(load_project(&state.db, id).await?))
}

/// POST /api/projects/:id/start
///
/// Creates tasks for entries that lack one and enqueues the coordinator.
/// A project already in `pending_search` may be started again: that is
/// the repair path for a start whose coordinator job never reached the
/// queue.
pub async fn start_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StartProjectResponse>> {
    let project = load_project(&state.db, id).await?;

    if project.status != ProjectStatus::PendingSearch {
        project.status.ensure_transition(ProjectStatus::PendingSearch)?;
        let rows = db::projects::conditional_update_project_status(
            &state.db,
            id,
            project.status,
            ProjectStatus::PendingSearch,
        )
        .await?;
        if rows == 0 {
            return Err(ApiError::Conflict("project status changed concurrently".to_string()));
        }
    }

    let missing = db::entries::entry_ids_without_task(&state.db, id).await?;
    let tasks_created = db::tasks::create_tasks_for_entries(&state.db, id, &missing).await?;
    let total_entries = db::entries::count_entries(&state.db, id).await?;
    let tasks_existing = total_entries - tasks_created as i64;

    if let Err(e) = state.dispatcher.enqueue_coordinator(id, None).await {
        // project stays pending_search; a repeated start re-arms it
        warn!("project {}: coordinator enqueue failed: {}", id, e);
        return Err(ApiError::Internal(
            "could not enqueue coordinator job; retry start".to_string(),
        ));
    }

    info!(
        "project {} started: {} tasks created, {} already present",
        id, tasks_created, tasks_existing
    );
    state.event_bus.emit_lossy(RelinkEvent::ProjectStarted {
        project_id: id,
        tasks_created,
        timestamp: relink_common::time::now(),
    });

    Ok(Json(StartProjectResponse {
        project_id: id,
        tasks_created,
        tasks_existing,
    }))
}

/// POST /api/projects/:id/rerun
///
/// Applies the retry edge to every selected task that has one (only
/// `failed` does), stages the project for the coordinator, and reports
/// requeued/skipped counts.
pub async fn rerun_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RerunRequest>,
) -> ApiResult<Json<RerunResponse>> {
    let project = load_project(&state.db, id).await?;
    if project.status == ProjectStatus::Archived {
        return Err(ApiError::Conflict("project is archived".to_string()));
    }

    let selected: Vec<Task> = match request.criteria {
        RerunCriteria::Failed => {
            db::tasks::list_tasks_for_project(&state.db, id, Some(TaskStatus::Failed)).await?
        }
        RerunCriteria::NoCandidates => {
            db::tasks::list_tasks_for_project(&state.db, id, Some(TaskStatus::NoCandidatesFound))
                .await?
        }
        RerunCriteria::NoAccepted => {
            db::tasks::list_tasks_for_project(&state.db, id, Some(TaskStatus::AwaitingReview))
                .await?
        }
    };

    let mut requeued_ids: Vec<Uuid> = Vec::new();
    let mut skipped = 0u64;
    for task in &selected {
        if task.status == TaskStatus::Failed {
            if db::tasks::requeue_task_for_retry(&state.db, task.id).await? > 0 {
                requeued_ids.push(task.id);
            } else {
                skipped += 1;
            }
        } else {
            skipped += 1;
        }
    }

    if !requeued_ids.is_empty() {
        match project.status {
            ProjectStatus::ProcessingFailed => {
                let rows = db::projects::conditional_update_project_status(
                    &state.db,
                    id,
                    ProjectStatus::ProcessingFailed,
                    ProjectStatus::PendingProcessing,
                )
                .await?;
                if rows == 0 {
                    return Err(ApiError::Conflict(
                        "project status changed concurrently".to_string(),
                    ));
                }
                if let Err(e) = state
                    .dispatcher
                    .enqueue_coordinator(id, Some(requeued_ids.clone()))
                    .await
                {
                    // tasks are queued; the sweeper re-enqueues them
                    warn!("project {}: rerun enqueue failed: {}", id, e);
                }
            }
            ProjectStatus::Processing => {
                // mid-flight rerun: feed the queued tasks straight to workers
                if let Err(e) = state
                    .dispatcher
                    .enqueue_match_batch(id, requeued_ids.clone())
                    .await
                {
                    warn!("project {}: rerun enqueue failed: {}", id, e);
                }
            }
            other => {
                warn!(
                    "project {}: requeued {} tasks while project is {}",
                    id,
                    requeued_ids.len(),
                    other
                );
            }
        }
    }

    info!(
        "project {}: rerun {:?} requeued {} skipped {}",
        id,
        request.criteria,
        requeued_ids.len(),
        skipped
    );
    Ok(Json(RerunResponse {
        requeued: requeued_ids.len() as u64,
        skipped,
    }))
}

/// POST /api/projects/:id/archive
pub async fn archive_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    let project = load_project(&state.db, id).await?;
    project.status.ensure_transition(ProjectStatus::Archived)?;

    let rows = db::projects::conditional_update_project_status(
        &state.db,
        id,
        project.status,
        ProjectStatus::Archived,
    )
    .await?;
    if rows == 0 {
        return Err(ApiError::Conflict("project status changed concurrently".to_string()));
    }
    Ok(Json(load_project(&state.db, id).await?))
}

/// DELETE /api/projects/:id (soft)
pub async fn soft_delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let exists = db::projects::get_project(&state.db, id).await?.is_some();
    if !exists {
        return Err(ApiError::NotFound(format!("project {}", id)));
    }
    // already-flagged rows affect zero rows; the delete is idempotent
    db::projects::set_project_soft_deleted(&state.db, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/projects/:id/stats
pub async fn project_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProjectStatsResponse>> {
    let project = load_project(&state.db, id).await?;
    let by_status = db::tasks::status_counts(&state.db, id).await?;
    let total_tasks: i64 = by_status.values().sum();

    let reviewed_tasks: i64 = by_status
        .iter()
        .filter(|(status, _)| {
            status
                .parse::<TaskStatus>()
                .map(|s| s.is_settled_by_review())
                .unwrap_or(false)
        })
        .map(|(_, count)| *count)
        .sum();

    let review_progress = if total_tasks > 0 {
        reviewed_tasks as f64 / total_tasks as f64
    } else {
        0.0
    };

    Ok(Json(ProjectStatsResponse {
        project_id: id,
        status: project.status,
        total_tasks,
        by_status,
        reviewed_tasks,
        review_progress,
    }))
}

/// POST /api/projects/:id/entries
pub async fn ingest_entries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<IngestEntriesRequest>,
) -> ApiResult<(StatusCode, Json<IngestEntriesResponse>)> {
    load_project(&state.db, id).await?;
    if request.entries.is_empty() {
        return Err(ApiError::BadRequest("entries must not be empty".to_string()));
    }
    for (index, entry) in request.entries.iter().enumerate() {
        if entry.display_name.trim().is_empty() {
            return Err(ApiError::BadRequest(format!(
                "entries[{}].display_name must not be blank",
                index
            )));
        }
    }

    let entry_ids = db::entries::insert_entries(&state.db, id, &request.entries).await?;
    info!("project {}: ingested {} entries", id, entry_ids.len());
    Ok((
        StatusCode::CREATED,
        Json(IngestEntriesResponse {
            inserted: entry_ids.len(),
            entry_ids,
        }),
    ))
}

/// GET /api/projects/:id/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    load_project(&state.db, id).await?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let tasks = db::tasks::list_tasks_for_project(&state.db, id, status).await?;
    Ok(Json(tasks))
}

/// Build project routes
pub fn project_routes() -> Router<AppState> {
    Router::new()
        .route("/api/projects", post(create_project))
        .route(
            "/api/projects/:id",
            get(get_project).delete(soft_delete_project),
        )
        .route("/api/projects/:id/activate", post(activate_project))
        .route("/api/projects/:id/start", post(start_project))
        .route("/api/projects/:id/rerun", post(rerun_tasks))
        .route("/api/projects/:id/archive", post(archive_project))
        .route("/api/projects/:id/stats", get(project_stats))
        .route("/api/projects/:id/entries", post(ingest_entries))
        .route("/api/projects/:id/tasks", get(list_tasks))
}
