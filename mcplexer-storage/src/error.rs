//! Error types for store operations

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Unique constraint would be violated
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// Concurrent or invalid state transition
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Entity failed validation before write
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Underlying database error
    #[error("Database error: {message}")]
    Database { message: String },

    /// Migration failure
    #[error("Migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    /// JSON column (de)serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Check whether this is the `NotFound` sentinel
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::Database {
                message: "row not found".to_string(),
            },
            other => StoreError::Database {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: err.to_string(),
        }
    }
}
