//! Store error types.

use thiserror::Error;
use vscan_api::{ApiError, ResourceKind};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Resource store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: String },

    /// An object with the same key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ResourceKind, key: String },

    /// Optimistic concurrency check failed.
    #[error("{kind} {key} version conflict: expected {expected}, got {actual}")]
    Conflict {
        kind: ResourceKind,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The request was rejected as invalid.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An object could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An object mutation was rejected.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Errors that a retry may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}
