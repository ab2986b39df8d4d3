//! Node error types

use infrax_core::domain::job::JobState;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors surfaced to callers of the node
///
/// Job outcomes such as launch failures and timeouts are not errors: they
/// are recorded on the job as a `FailureReason`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: JobState, to: JobState },

    #[error("Job {id} is {state}")]
    InvalidState { id: Uuid, state: JobState },

    #[error("Queue is full ({capacity} jobs)")]
    CapacityExceeded { capacity: usize },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("App {0} is not installed")]
    AppNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node unavailable: {0}")]
    Unavailable(String),
}

impl NodeError {
    /// Misuse by the caller, as opposed to a fault of the node
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            NodeError::DuplicateJob(_)
                | NodeError::NotFound(_)
                | NodeError::InvalidTransition { .. }
                | NodeError::InvalidState { .. }
                | NodeError::CapacityExceeded { .. }
                | NodeError::Validation(_)
                | NodeError::AppNotFound(_)
                | NodeError::Conflict(_)
        )
    }

    /// A store failure that may clear on its own: a locked or busy
    /// database, an exhausted pool, I/O trouble
    ///
    /// Rows that cannot be decoded will not get better by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Storage(e) => !matches!(
                e,
                sqlx::Error::Decode(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::RowNotFound
            ),
            _ => false,
        }
    }
}
