//! Thumbnail artifact records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::file::FileId;
use crate::job::JobId;

/// Unique identifier for a thumbnail artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThumbnailId(pub String);

impl ThumbnailId {
    /// Generate a new random thumbnail ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThumbnailId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThumbnailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable thumbnail artifact. Owned by its job; deleting the job
/// deletes the record (the on-disk file is left to housekeeping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    /// Unique thumbnail ID
    pub id: ThumbnailId,
    /// Owning job
    pub job_id: JobId,
    /// Source file
    pub file_id: FileId,
    /// Dimension string, `WxH`
    pub size: String,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Stored filename (`thumb_<uuid>.{jpg|png}`)
    pub file_name: String,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Server-relative URL path
    pub url_path: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl ThumbnailRecord {
    /// Create a record for an artifact already written to disk.
    ///
    /// `url_base` is the server-relative prefix (e.g. `/uploads/thumbnails`).
    pub fn new(
        job_id: JobId,
        file_id: FileId,
        width: u32,
        height: u32,
        path: impl Into<PathBuf>,
        url_base: &str,
    ) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url_path = format!("{}/{}", url_base.trim_end_matches('/'), file_name);
        Self {
            id: ThumbnailId::new(),
            job_id,
            file_id,
            size: format!("{}x{}", width, height),
            width,
            height,
            file_name,
            path,
            url_path,
            created_at: Utc::now(),
        }
    }
}
