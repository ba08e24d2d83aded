//! Job and thumbnail persistence with lifecycle validation.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use thumbly_models::{FileId, Job, JobId, JobStatus, ThumbnailId, ThumbnailRecord};

use crate::error::{StoreError, StoreResult};

/// Optional fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    /// New progress value (left untouched when `None`)
    pub progress: Option<u8>,
    /// Error message; only applied on the `Failed` transition
    pub error: Option<String>,
    /// Processing start time; stamped once, on the first `Processing` transition
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time; stamped on `Completed`/`Failed` transitions
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusPatch {
    /// Patch for the `-> Processing` transition.
    pub fn processing(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Patch for the `-> Completed` transition.
    pub fn completed() -> Self {
        Self {
            progress: Some(100),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Patch for the `-> Failed` transition.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// CRUD over jobs and their thumbnail artifacts.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    user_id: String,
    file_id: String,
    status: String,
    progress: i64,
    thumbnail_sizes: String,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self, thumbnails: Vec<ThumbnailRecord>) -> StoreResult<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::not_found("JobStatus", self.status.clone()))?;
        Ok(Job {
            id: JobId::from_string(self.id),
            user_id: self.user_id,
            file_id: FileId::from_string(self.file_id),
            status,
            progress: self.progress.clamp(0, 100) as u8,
            thumbnail_sizes: serde_json::from_str(&self.thumbnail_sizes)?,
            thumbnails,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ThumbnailRow {
    id: String,
    job_id: String,
    file_id: String,
    size: String,
    width: i64,
    height: i64,
    file_name: String,
    path: String,
    url_path: String,
    created_at: DateTime<Utc>,
}

impl ThumbnailRow {
    fn into_record(self) -> ThumbnailRecord {
        ThumbnailRecord {
            id: ThumbnailId::from_string(self.id),
            job_id: JobId::from_string(self.job_id),
            file_id: FileId::from_string(self.file_id),
            size: self.size,
            width: self.width as u32,
            height: self.height as u32,
            file_name: self.file_name,
            path: PathBuf::from(self.path),
            url_path: self.url_path,
            created_at: self.created_at,
        }
    }
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a pending job for an existing file owned by `user_id`.
    pub async fn create_job(
        &self,
        user_id: &str,
        file_id: &FileId,
        thumbnail_sizes: Vec<String>,
    ) -> StoreResult<Job> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM files WHERE id = ?")
                .bind(file_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match owner {
            None => return Err(StoreError::not_found("File", file_id.as_str())),
            Some(owner) if owner != user_id => {
                return Err(StoreError::Ownership {
                    entity: "File",
                    id: file_id.as_str().to_string(),
                })
            }
            Some(_) => {}
        }

        let job = Job::new(user_id, file_id.clone(), thumbnail_sizes);
        sqlx::query(
            r#"
            INSERT INTO jobs (id, user_id, file_id, status, progress, thumbnail_sizes,
                              error, started_at, completed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.user_id)
        .bind(job.file_id.as_str())
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(serde_json::to_string(&job.thumbnail_sizes)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, user_id, "created job");
        Ok(job)
    }

    /// Fetch a job with its thumbnails.
    pub async fn get_job(&self, id: &JobId) -> StoreResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("Job", id.as_str()))?;

        let thumbnails = sqlx::query_as::<_, ThumbnailRow>(
            "SELECT * FROM thumbnails WHERE job_id = ? ORDER BY created_at, id",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ThumbnailRow::into_record)
        .collect();

        row.into_job(thumbnails)
    }

    /// List a user's jobs, newest first, with thumbnails attached.
    pub async fn list_jobs_by_user(&self, user_id: &str) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let thumb_rows = sqlx::query_as::<_, ThumbnailRow>(
            r#"
            SELECT t.* FROM thumbnails t
            JOIN jobs j ON j.id = t.job_id
            WHERE j.user_id = ?
            ORDER BY t.created_at, t.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_job: HashMap<String, Vec<ThumbnailRecord>> = HashMap::new();
        for row in thumb_rows {
            by_job
                .entry(row.job_id.clone())
                .or_default()
                .push(row.into_record());
        }

        rows.into_iter()
            .map(|row| {
                let thumbs = by_job.remove(&row.id).unwrap_or_default();
                row.into_job(thumbs)
            })
            .collect()
    }

    /// Transition a job to `new_status`, applying `patch`.
    ///
    /// The transition is validated against the lifecycle graph and applied
    /// with an optimistic `WHERE status = <observed>` guard so concurrent
    /// writers cannot skip validation. `started_at` is stamped only once;
    /// `error` is cleared on every non-`Failed` transition.
    pub async fn set_status(
        &self,
        id: &JobId,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> StoreResult<()> {
        let current = self.current_status(id).await?;
        if !current.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                job_id: id.as_str().to_string(),
                from: current,
                to: new_status,
            });
        }

        let res = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?2,
                updated_at = ?3,
                progress = COALESCE(?4, progress),
                error = CASE WHEN ?2 = 'failed' THEN ?5 ELSE NULL END,
                started_at = CASE WHEN ?2 = 'processing'
                             THEN COALESCE(started_at, ?6) ELSE started_at END,
                completed_at = CASE WHEN ?2 IN ('completed', 'failed')
                               THEN COALESCE(?7, completed_at) ELSE completed_at END
            WHERE id = ?1 AND status = ?8
            "#,
        )
        .bind(id.as_str())
        .bind(new_status.as_str())
        .bind(Utc::now())
        .bind(patch.progress.map(|p| p.min(100) as i64))
        .bind(&patch.error)
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            // Lost a race with a concurrent transition; report what we now see.
            let observed = self.current_status(id).await?;
            return Err(StoreError::InvalidTransition {
                job_id: id.as_str().to_string(),
                from: observed,
                to: new_status,
            });
        }

        debug!(job_id = %id, from = %current, to = %new_status, "job transition");
        Ok(())
    }

    /// Update progress of a processing job. Values only ever increase within
    /// an attempt; lower values are ignored.
    pub async fn update_progress(&self, id: &JobId, progress: u8) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET progress = MAX(progress, ?2), updated_at = ?3
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id.as_str())
        .bind(progress.min(100) as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a generated thumbnail and touch the job.
    pub async fn append_thumbnail(&self, thumbnail: &ThumbnailRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO thumbnails (id, job_id, file_id, size, width, height,
                                    file_name, path, url_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(thumbnail.id.as_str())
        .bind(thumbnail.job_id.as_str())
        .bind(thumbnail.file_id.as_str())
        .bind(&thumbnail.size)
        .bind(thumbnail.width as i64)
        .bind(thumbnail.height as i64)
        .bind(&thumbnail.file_name)
        .bind(thumbnail.path.to_string_lossy().as_ref())
        .bind(&thumbnail.url_path)
        .bind(thumbnail.created_at)
        .execute(&mut *tx)
        .await?;

        let res = sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(thumbnail.job_id.as_str())
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found("Job", thumbnail.job_id.as_str()));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Reset a failed job for another attempt: back to `Pending`, progress 0,
    /// error and both lifecycle timestamps cleared.
    pub async fn reset_for_retry(&self, id: &JobId) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', progress = 0, error = NULL,
                            started_at = NULL, completed_at = NULL, updated_at = ?2
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            let observed = self.current_status(id).await?;
            return Err(StoreError::InvalidTransition {
                job_id: id.as_str().to_string(),
                from: observed,
                to: JobStatus::Pending,
            });
        }

        debug!(job_id = %id, "job reset for retry");
        Ok(())
    }

    /// Delete a job; its thumbnail records cascade.
    pub async fn delete_job(&self, id: &JobId) -> StoreResult<()> {
        let res = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found("Job", id.as_str()));
        }
        Ok(())
    }

    async fn current_status(&self, id: &JobId) -> StoreResult<JobStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let status = status.ok_or_else(|| StoreError::not_found("Job", id.as_str()))?;
        JobStatus::parse(&status).ok_or_else(|| StoreError::not_found("JobStatus", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbly_models::{FileKind, FileRecord};

    use crate::db::{connect, init_schema};
    use crate::files::FileStore;

    async fn mem_stores() -> (FileStore, JobStore) {
        // A single connection keeps every query on the same in-memory database.
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        init_schema(&pool).await.unwrap();
        (FileStore::new(pool.clone()), JobStore::new(pool))
    }

    async fn seed_file(files: &FileStore, user_id: &str) -> FileRecord {
        let file = FileRecord::new(
            user_id,
            "cat.jpg",
            format!("{}.jpg", uuid_like()),
            "image/jpeg",
            1024,
            "/data/uploads/cat.jpg",
            FileKind::Image,
        );
        files.create_file(&file).await.unwrap();
        file
    }

    fn uuid_like() -> String {
        thumbly_models::FileId::new().to_string()
    }

    async fn seed_job(files: &FileStore, jobs: &JobStore, user_id: &str) -> Job {
        let file = seed_file(files, user_id).await;
        jobs.create_job(user_id, &file.id, vec!["128x128".to_string()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        let fetched = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.progress, 0);
        assert_eq!(fetched.thumbnail_sizes, vec!["128x128".to_string()]);
        assert!(fetched.thumbnails.is_empty());
    }

    #[tokio::test]
    async fn create_job_rejects_unknown_file() {
        let (_files, jobs) = mem_stores().await;
        let err = jobs
            .create_job("user-1", &FileId::new(), vec!["128x128".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "File", .. }));
    }

    #[tokio::test]
    async fn create_job_rejects_foreign_file() {
        let (files, jobs) = mem_stores().await;
        let file = seed_file(&files, "owner").await;
        let err = jobs
            .create_job("intruder", &file.id, vec!["128x128".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Ownership { .. }));
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        jobs.set_status(&job.id, JobStatus::Queued, StatusPatch::default())
            .await
            .unwrap();
        jobs.set_status(&job.id, JobStatus::Processing, StatusPatch::processing(10))
            .await
            .unwrap();

        let processing = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(processing.status, JobStatus::Processing);
        assert_eq!(processing.progress, 10);
        assert!(processing.started_at.is_some());
        assert!(processing.completed_at.is_none());

        jobs.set_status(&job.id, JobStatus::Completed, StatusPatch::completed())
            .await
            .unwrap();

        let done = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        let completed_at = done.completed_at.expect("completed_at stamped");
        assert!(done.started_at.unwrap() <= completed_at);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        let err = jobs
            .set_status(&job.id, JobStatus::Completed, StatusPatch::completed())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failure_sets_error_and_completed_at() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        jobs.set_status(&job.id, JobStatus::Queued, StatusPatch::default())
            .await
            .unwrap();
        jobs.set_status(&job.id, JobStatus::Processing, StatusPatch::processing(10))
            .await
            .unwrap();
        jobs.set_status(
            &job.id,
            JobStatus::Failed,
            StatusPatch::failed("input file not found"),
        )
        .await
        .unwrap();

        let failed = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("input file not found"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn started_at_is_stamped_once() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        jobs.set_status(&job.id, JobStatus::Processing, StatusPatch::processing(10))
            .await
            .unwrap();
        let first = jobs.get_job(&job.id).await.unwrap().started_at.unwrap();

        jobs.set_status(&job.id, JobStatus::Failed, StatusPatch::failed("boom"))
            .await
            .unwrap();
        // A later processing patch must not overwrite the original stamp.
        jobs.reset_for_retry(&job.id).await.unwrap();
        jobs.set_status(&job.id, JobStatus::Processing, StatusPatch::processing(10))
            .await
            .unwrap();
        let second = jobs.get_job(&job.id).await.unwrap().started_at.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn reset_for_retry_clears_failure_state() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        jobs.set_status(&job.id, JobStatus::Failed, StatusPatch::failed("boom"))
            .await
            .unwrap();
        jobs.reset_for_retry(&job.id).await.unwrap();

        let reset = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.progress, 0);
        assert!(reset.error.is_none());
        assert!(reset.started_at.is_none());
        assert!(reset.completed_at.is_none());
    }

    #[tokio::test]
    async fn reset_for_retry_requires_failed() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        let err = jobs.reset_for_retry(&job.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_processing_only() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        // Not processing yet: silently ignored.
        jobs.update_progress(&job.id, 50).await.unwrap();
        assert_eq!(jobs.get_job(&job.id).await.unwrap().progress, 0);

        jobs.set_status(&job.id, JobStatus::Processing, StatusPatch::processing(10))
            .await
            .unwrap();
        jobs.update_progress(&job.id, 40).await.unwrap();
        jobs.update_progress(&job.id, 20).await.unwrap();
        assert_eq!(jobs.get_job(&job.id).await.unwrap().progress, 40);
    }

    #[tokio::test]
    async fn append_thumbnail_and_cascade_delete() {
        let (files, jobs) = mem_stores().await;
        let job = seed_job(&files, &jobs, "user-1").await;

        let thumb = ThumbnailRecord::new(
            job.id.clone(),
            job.file_id.clone(),
            128,
            128,
            "/data/uploads/thumbnails/thumb_x.jpg",
            "/uploads/thumbnails",
        );
        jobs.append_thumbnail(&thumb).await.unwrap();

        let fetched = jobs.get_job(&job.id).await.unwrap();
        assert_eq!(fetched.thumbnails.len(), 1);
        assert_eq!(fetched.thumbnails[0].size, "128x128");

        jobs.delete_job(&job.id).await.unwrap();
        assert!(matches!(
            jobs.get_job(&job.id).await.unwrap_err(),
            StoreError::NotFound { entity: "Job", .. }
        ));
    }

    #[tokio::test]
    async fn list_jobs_newest_first() {
        let (files, jobs) = mem_stores().await;
        let first = seed_job(&files, &jobs, "user-1").await;
        let second = seed_job(&files, &jobs, "user-1").await;
        seed_job(&files, &jobs, "someone-else").await;

        let listed = jobs.list_jobs_by_user("user-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        // Jobs created in the same millisecond tie-break by id; both orders
        // keep the other user's job out.
        let ids: Vec<_> = listed.iter().map(|j| j.id.clone()).collect();
        assert!(ids.contains(&first.id));
        assert!(ids.contains(&second.id));
        assert!(listed[0].created_at >= listed[1].created_at);
    }
}
