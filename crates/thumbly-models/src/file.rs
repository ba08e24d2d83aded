//! Uploaded file records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    /// Generate a new random file ID.
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

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Broad media category of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Raster image (JPEG, PNG, WebP, ...)
    Image,
    /// Video container (MP4, MOV, WebM, ...)
    Video,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Video => "video",
        }
    }

    /// Parse from the stored string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(FileKind::Image),
            "video" => Some(FileKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An uploaded file. Immutable after creation; the upload boundary persists
/// the record and the bytes on disk before any job references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Unique file ID
    pub id: FileId,
    /// Owning user
    pub user_id: String,
    /// Display name as uploaded by the user
    pub original_name: String,
    /// Stored name on disk (`<uuid><ext>`), unique
    pub stored_name: String,
    /// MIME descriptor (e.g. `image/jpeg`)
    pub mime_type: String,
    /// Byte size, always > 0
    pub size_bytes: u64,
    /// Absolute storage path
    pub path: PathBuf,
    /// Media category
    pub kind: FileKind,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Create a new file record with a fresh ID.
    pub fn new(
        user_id: impl Into<String>,
        original_name: impl Into<String>,
        stored_name: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
        path: impl Into<PathBuf>,
        kind: FileKind,
    ) -> Self {
        Self {
            id: FileId::new(),
            user_id: user_id.into(),
            original_name: original_name.into(),
            stored_name: stored_name.into(),
            mime_type: mime_type.into(),
            size_bytes,
            path: path.into(),
            kind,
            created_at: Utc::now(),
        }
    }
}
