//! Structured error type for queue operations.

use thiserror::Error;

/// Pattern-matchable failure modes for queue operations.
///
/// Callers treat `Unavailable` as transient (retry with bounded attempts)
/// and `Backend` as a command-level problem worth logging loudly.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The Redis backend could not be reached.
    #[error("queue backend unavailable: {0}")]
    Unavailable(redis::RedisError),

    /// Redis rejected or failed the command.
    #[error("queue command failed: {0}")]
    Backend(redis::RedisError),

    /// A job payload could not be encoded or decoded.
    #[error("job payload codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// The queue has been closed; no further work is accepted.
    #[error("queue is closed")]
    Closed,
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            QueueError::Unavailable(err)
        } else {
            QueueError::Backend(err)
        }
    }
}

impl QueueError {
    /// True when the operation may be retried against the same backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}
