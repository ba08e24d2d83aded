//! Worker error types.

use thiserror::Error;
use thumbly_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job timeout")]
    JobTimeout,

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] thumbly_queue::QueueError),

    #[error("media error: {0}")]
    Media(#[from] thumbly_media::MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether a failed attempt should go back through the queue's retry
    /// path. Store invariant violations are programmer errors; retrying
    /// them cannot help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WorkerError::Store(StoreError::InvalidTransition { .. })
                | WorkerError::Store(StoreError::NotFound { .. })
                | WorkerError::Store(StoreError::Ownership { .. })
        )
    }
}
