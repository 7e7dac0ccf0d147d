//! HTTP API handlers for relink-matcher

pub mod candidates;
pub mod health;
pub mod projects;
pub mod sse;
pub mod tasks;

pub use candidates::candidate_routes;
pub use health::health_routes;
pub use projects::project_routes;
pub use sse::event_stream;
pub use tasks::task_routes;
