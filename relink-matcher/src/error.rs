//! API error types
//!
//! Maps domain errors onto HTTP statuses. Rejected state transitions are
//! conflicts (409), not server errors: the caller raced another writer or
//! asked for an illegal edge, and can re-read and retry.

use crate::models::TransitionError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. a lost optimistic-write race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Disallowed state transition (409)
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// relink-common error
    #[error(transparent)]
    Common(#[from] relink_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Transition(err) => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", err.to_string())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(err) => match err {
                relink_common::Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
                relink_common::Error::InvalidInput(msg) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
                }
                relink_common::Error::InvalidValue(msg) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
                }
                other => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    other.to_string(),
                ),
            },
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn status_of(error: ApiError) -> StatusCode {
        error.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(ApiError::NotFound("task".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ApiError::BadRequest("empty name".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Conflict("lost race".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transition_error_is_conflict() {
        let error = TransitionError {
            entity: EntityKind::Task.as_str(),
            from: "reviewed",
            to: "processing",
        };
        assert_eq!(status_of(ApiError::Transition(error)), StatusCode::CONFLICT);
    }

    #[test]
    fn test_common_error_granularity() {
        assert_eq!(
            status_of(ApiError::Common(relink_common::Error::NotFound(
                "no such row".to_string()
            ))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ApiError::Common(relink_common::Error::InvalidValue(
                "unknown task status 'bogus'".to_string()
            ))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Common(relink_common::Error::Internal(
                "boom".to_string()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
