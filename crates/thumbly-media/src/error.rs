//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while producing a thumbnail.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("unsupported media kind: {0}")]
    UnsupportedKind(String),

    #[error("failed to probe input format: {0}")]
    ProbeFailed(String),

    #[error("failed to encode thumbnail: {0}")]
    EncodeFailed(String),

    #[error("thumbnail output is empty: {0}")]
    EmptyOutput(PathBuf),

    #[error("frame extraction failed: {message}")]
    ExtractionFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("frame extraction timed out after {0} seconds")]
    ExtractionTimeout(u64),

    #[error("ffmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create a frame-extraction failure error.
    pub fn extraction_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ExtractionFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
