//! Processing envelope carried through the queue.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use thumbly_models::{FileId, FileKind, JobId};

/// Everything a worker needs to process one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEnvelope {
    /// Job being processed
    pub job_id: JobId,
    /// Input file reference
    pub file_id: FileId,
    /// Owning user (for event routing at the edge)
    pub user_id: String,
    /// Absolute path of the input file
    pub file_path: PathBuf,
    /// Media category of the input
    pub kind: FileKind,
    /// Requested output sizes as `WxH` strings
    pub thumbnail_sizes: Vec<String>,
    /// Absolute directory for generated artifacts
    pub output_dir: PathBuf,
    /// When the envelope was enqueued
    pub created_at: DateTime<Utc>,
}

impl ProcessingEnvelope {
    pub fn new(
        job_id: JobId,
        file_id: FileId,
        user_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        kind: FileKind,
        thumbnail_sizes: Vec<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id,
            file_id,
            user_id: user_id.into(),
            file_path: file_path.into(),
            kind,
            thumbnail_sizes,
            output_dir: output_dir.into(),
            created_at: Utc::now(),
        }
    }

    /// Dedup key: at most one live queue entry per job.
    pub fn idempotency_key(&self) -> &str {
        self.job_id.as_str()
    }
}
