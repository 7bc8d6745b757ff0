//! Task subsystem error types.

use thiserror::Error;

use super::types::{TaskId, TaskStatus};
use crate::mcp_client::{ErrorKind, McpError};

/// Errors returned by the task registry and supervisor.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("unknown task: '{id}'")]
    NotFound { id: TaskId },

    /// The transition is not allowed from the task's current status.
    #[error("cannot {operation} task '{id}' while it is {status}")]
    Conflict {
        id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error("task '{id}' is not cancellable")]
    NotCancellable { id: TaskId },

    #[error("task '{id}' cannot be paused")]
    NotPausable { id: TaskId },

    /// The operation was torn down before it reported an outcome.
    #[error("task '{id}' was terminated before producing a result")]
    Aborted { id: TaskId },
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NotFound { .. } => ErrorKind::NotFound,
            TaskError::Conflict { .. }
            | TaskError::NotCancellable { .. }
            | TaskError::NotPausable { .. } => ErrorKind::Conflict,
            TaskError::Aborted { .. } => ErrorKind::Cancelled,
        }
    }
}

/// How a supervised operation can end without a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    /// The operation observed its cancellation signal.
    #[error("cancelled")]
    Cancelled,
    #[error("{message}")]
    Failed { message: String },
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        OperationError::Failed {
            message: message.into(),
        }
    }
}

impl From<McpError> for OperationError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Cancelled { .. } => OperationError::Cancelled,
            other => OperationError::failed(other.to_string()),
        }
    }
}
