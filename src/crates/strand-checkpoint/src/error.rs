//! Error types for checkpoint operations

use thiserror::Error;

use crate::checkpoint::CheckpointId;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Unknown thread or checkpoint
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// A different checkpoint with the same id was already committed
    #[error("Checkpoint {checkpoint_id} already exists in thread '{thread_id}'")]
    Conflict {
        thread_id: String,
        checkpoint_id: CheckpointId,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid checkpoint or request
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite backend error
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl CheckpointError {
    pub fn not_found(thread_id: &str, checkpoint_id: CheckpointId) -> Self {
        CheckpointError::NotFound(format!(
            "checkpoint {} in thread '{}'",
            checkpoint_id, thread_id
        ))
    }

    /// Whether the error comes from the storage medium rather than the request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            CheckpointError::Storage(_) | CheckpointError::Io(_) => true,
            #[cfg(feature = "sqlite")]
            CheckpointError::Sqlx(_) => true,
            _ => false,
        }
    }
}
