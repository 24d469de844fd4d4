use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("transient I/O error: {message}")]
    TransientIo {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("permanent I/O error: {0}")]
    PermanentIo(String),

    #[error("capacity error: {0}")]
    Capacity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl SyncError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Only network-level hiccups are worth another attempt; everything else
    /// would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientIo { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
