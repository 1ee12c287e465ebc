//! Error types for rmsq.

use thiserror::Error;

use crate::model::RequestId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("request '{name}' already exists (RequestID={existing})")]
    DuplicateName { name: String, existing: RequestId },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request '{0}' is already Assigned and cannot be selected")]
    AlreadyAssigned(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Faults of the store or environment, as opposed to a caller asking for
    /// something the queue refuses.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Database(_) | Error::Io(_) | Error::Other(_)
        )
    }

    /// Log a failed transaction. Refusals stay at debug.
    pub(crate) fn trace_rollback(&self, op: &str) {
        if self.is_unexpected() {
            tracing::warn!(op, error = %self, "transaction rolled back");
        } else {
            tracing::debug!(op, error = %self, "transaction rolled back");
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
