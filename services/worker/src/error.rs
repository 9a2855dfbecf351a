//! Worker error types.

use std::io;

use thiserror::Error;
use vscan_api::ApiError;
use vscan_store::StoreError;

pub use crate::scanner::ScannerError;

/// Errors from handling one task.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload cannot be decoded. Redelivery will not help.
    #[error("malformed task: {0}")]
    Malformed(#[source] ApiError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode VEX repository descriptor: {0}")]
    VexDescriptor(#[from] serde_yaml::Error),

    #[error("failed to encode SBOM: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("scan failed: {0}")]
    Scanner(#[from] ScannerError),

    #[error("scanner produced an unreadable report: {0}")]
    InvalidReport(#[source] serde_json::Error),
}

impl HandlerError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Whether the bus should redeliver the task.
    ///
    /// Only a malformed payload is final; every other failure is left to
    /// the bus's redelivery limit.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}
