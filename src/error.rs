//! Error types for Schedule Core.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

use crate::models::ConflictReport;

/// Result type alias for Schedule operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Main error type for Schedule operations
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Version conflict: {0}")]
    VersionConflict(Box<ConflictReport>),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ScheduleError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ScheduleError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new sync error
    pub fn sync(message: impl Into<String>) -> Self {
        ScheduleError::Sync(message.into())
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        ScheduleError::DatabaseOperation(message.into())
    }

    /// Create a new not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        ScheduleError::NotFound(message.into())
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures are retryable: version checking keeps a change
    /// from applying twice, and a retry whose first attempt landed comes
    /// back as a conflict. Everything else needs new input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScheduleError::Network(_) | ScheduleError::Timeout(_))
    }
}

/// Validation error with field and message
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for ScheduleError {
    fn from(err: ValidationError) -> Self {
        ScheduleError::Validation {
            field: err.field,
            message: err.message,
        }
    }
}
