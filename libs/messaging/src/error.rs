//! Bus and publisher errors.

use thiserror::Error;
use vscan_api::ApiError;

/// Errors raised by a [`crate::MessageBus`].
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus connection is closed.
    #[error("bus connection closed")]
    Closed,

    /// The bus could not be reached.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The subject name is not valid.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
}

impl BusError {
    /// Errors that a retry may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors returned by [`crate::TaskPublisher::publish`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// The publisher is draining or stopped and accepts no new messages.
    #[error("publisher is shut down")]
    ShuttingDown,

    /// The publish was aborted by a shutdown that ran out of drain time.
    #[error("publish to {subject} cancelled")]
    Cancelled { subject: String },

    /// The message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] ApiError),

    /// Every attempt failed.
    #[error("publish to {subject} failed after {attempts} attempts: {source}")]
    Exhausted {
        subject: String,
        attempts: u32,
        #[source]
        source: BusError,
    },

    /// The bus rejected the message permanently.
    #[error(transparent)]
    Bus(BusError),
}
