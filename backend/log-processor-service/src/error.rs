use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Stream error: {0}")]
    Stream(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence timed out after {0:?}")]
    PersistTimeout(Duration),

    #[error("Malformed stream entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Shutdown requested")]
    ShutdownRequested,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<resilience::TimeoutError> for ProcessorError {
    fn from(err: resilience::TimeoutError) -> Self {
        match err {
            resilience::TimeoutError::Elapsed(after) => ProcessorError::PersistTimeout(after),
        }
    }
}

impl ProcessorError {
    /// Infrastructure failures that are expected to clear on their own
    /// (connection refused/dropped, timeouts, a replica still loading).
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessorError::Stream(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::BusyLoadingError
                            | redis::ErrorKind::TryAgain
                            | redis::ErrorKind::ClusterDown
                            | redis::ErrorKind::MasterDown
                            | redis::ErrorKind::ReadOnly
                    )
            }
            ProcessorError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            ProcessorError::PersistTimeout(_) => true,
            ProcessorError::Io(_) => true,
            _ => false,
        }
    }
}

/// `XGROUP CREATE` reply when the group is already there.
pub(crate) fn is_busy_group(err: &redis::RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

/// Reply to group commands after the group (or the stream) was deleted.
pub(crate) fn is_missing_group(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
