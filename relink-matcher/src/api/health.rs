//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// "up" or "down"
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_jobs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_jobs: Option<i64>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);

    let database_up = sqlx::query("SELECT 1").fetch_one(&state.db).await.is_ok();
    let queued_jobs = state.dispatcher.queued_depth().await.ok();
    let dead_letter_jobs = state.dispatcher.dead_letter_count().await.ok();

    Json(HealthResponse {
        status: if database_up { "ok" } else { "degraded" }.to_string(),
        module: "relink-matcher".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        database: if database_up { "up" } else { "down" }.to_string(),
        queued_jobs,
        dead_letter_jobs,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
