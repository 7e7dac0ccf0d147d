//! relink-matcher library interface
//!
//! Record reconciliation matching pipeline: external-dataset entries are
//! matched against knowledge-base entities through an asynchronous
//! coordinator/worker pipeline, with review actions exposed over HTTP.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use crate::services::dispatcher::JobDispatcher;
use axum::Router;
use chrono::{DateTime, Utc};
use relink_common::events::EventBus;
use sqlx::SqlitePool;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Job dispatch into the pipeline
    pub dispatcher: JobDispatcher,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, dispatcher: JobDispatcher) -> Self {
        Self {
            db,
            event_bus,
            dispatcher,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .route("/events", get(api::event_stream))
        .merge(api::project_routes())
        .merge(api::task_routes())
        .merge(api::candidate_routes())
        .merge(api::health_routes())
        .with_state(state)
}
