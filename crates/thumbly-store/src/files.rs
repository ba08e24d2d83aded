//! File record persistence.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use thumbly_models::{FileId, FileKind, FileRecord};

use crate::error::{StoreError, StoreResult};

/// CRUD over uploaded file records.
///
/// Records are created by the upload boundary and never mutated.
#[derive(Clone)]
pub struct FileStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: String,
    user_id: String,
    original_name: String,
    stored_name: String,
    mime_type: String,
    size_bytes: i64,
    path: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl FileRow {
    fn into_record(self) -> StoreResult<FileRecord> {
        let kind = FileKind::parse(&self.kind)
            .ok_or_else(|| StoreError::not_found("FileKind", self.kind.clone()))?;
        Ok(FileRecord {
            id: FileId::from_string(self.id),
            user_id: self.user_id,
            original_name: self.original_name,
            stored_name: self.stored_name,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes as u64,
            path: PathBuf::from(self.path),
            kind,
            created_at: self.created_at,
        })
    }
}

impl FileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new file record.
    pub async fn create_file(&self, file: &FileRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files (id, user_id, original_name, stored_name, mime_type,
                               size_bytes, path, kind, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file.id.as_str())
        .bind(&file.user_id)
        .bind(&file.original_name)
        .bind(&file.stored_name)
        .bind(&file.mime_type)
        .bind(file.size_bytes as i64)
        .bind(file.path.to_string_lossy().as_ref())
        .bind(file.kind.as_str())
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a file record by ID.
    pub async fn get_file(&self, id: &FileId) -> StoreResult<FileRecord> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("File", id.as_str()))?;
        row.into_record()
    }

    /// List a user's files, newest first.
    pub async fn list_files_by_user(&self, user_id: &str) -> StoreResult<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FileRow::into_record).collect()
    }

    /// Delete a file record.
    pub async fn delete_file(&self, id: &FileId) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found("File", id.as_str()));
        }
        Ok(())
    }
}
