//! Common error types for Relink

use thiserror::Error;

/// Common result type for Relink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the Relink services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization error (wraps serde_json::Error)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stored value failed to parse (status string, UUID, timestamp)
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}
