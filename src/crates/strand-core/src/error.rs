//! Error types for workflow execution
//!
//! [`WorkflowError`] is the single error type surfaced by tasks, the executor and the
//! entrypoint orchestrator. Store failures are translated at the boundary:
//!
//! | [`CheckpointError`] | [`WorkflowError`] | Caller action |
//! |---------------------|-------------------|---------------|
//! | `NotFound` | `NotFound` | Fix the thread or checkpoint id; never retried |
//! | `Conflict` | `Conflict` | Re-run against the refreshed latest checkpoint |
//! | anything else | `StoreUnavailable` | Invocation-fatal |

use std::time::Duration;

use strand_checkpoint::{CheckpointError, CheckpointId};
use thiserror::Error;

/// Convenience result type using [`WorkflowError`]
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors produced while running workflows
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Unknown thread or checkpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another invocation committed the checkpoint id this one computed
    #[error("Checkpoint {checkpoint_id} of thread '{thread_id}' was committed concurrently")]
    Conflict {
        thread_id: String,
        checkpoint_id: CheckpointId,
    },

    /// A task function failed after exhausting its retry policy
    ///
    /// Local to the [`TaskHandle`](crate::TaskHandle) until the workflow body propagates it.
    #[error("Task '{task_id}' failed: {source}")]
    Task {
        task_id: String,
        #[source]
        source: Box<WorkflowError>,
    },

    /// The checkpoint store could not serve a request
    #[error("Checkpoint store unavailable: {0}")]
    StoreUnavailable(#[source] CheckpointError),

    /// The invocation deadline expired
    #[error("Workflow timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid engine or run configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure raised by user code
    #[error("Execution failed: {0}")]
    Execution(String),
}

impl WorkflowError {
    /// Create an execution error, the usual way task functions report failure
    pub fn execution(message: impl Into<String>) -> Self {
        WorkflowError::Execution(message.into())
    }

    pub fn task(task_id: impl Into<String>, source: WorkflowError) -> Self {
        WorkflowError::Task {
            task_id: task_id.into(),
            source: Box::new(source),
        }
    }

    /// Whether re-running the invocation against the refreshed thread head can succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkflowError::Conflict { .. })
    }
}

impl From<CheckpointError> for WorkflowError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::NotFound(what) => WorkflowError::NotFound(what),
            CheckpointError::Conflict {
                thread_id,
                checkpoint_id,
            } => WorkflowError::Conflict {
                thread_id,
                checkpoint_id,
            },
            other => WorkflowError::StoreUnavailable(other),
        }
    }
}
