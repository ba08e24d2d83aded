//! Pipeline facade for the upload boundary.

use std::sync::Arc;

use tracing::info;

use thumbly_models::{FileId, Job, JobId, JobStatus};
use thumbly_queue::{EventBus, JobQueue, ProcessingEnvelope};
use thumbly_store::{FileStore, JobStore, StatusPatch, StoreError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

/// The assembled pipeline: store, queue, and bus behind one value.
///
/// Constructed once at startup and passed explicitly; there is no global
/// state. The upload boundary calls `enqueue_job` after persisting the
/// file record and bytes; everything else is user-facing job management.
pub struct Pipeline {
    files: FileStore,
    jobs: JobStore,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
    config: WorkerConfig,
}

impl Pipeline {
    /// Assemble a pipeline from already-constructed parts.
    pub fn new(
        files: FileStore,
        jobs: JobStore,
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            files,
            jobs,
            queue,
            events,
            config,
        }
    }

    /// Open the store, queue, and bus described by `config`.
    pub async fn connect(config: WorkerConfig) -> WorkerResult<Self> {
        let pool = thumbly_store::connect(&config.database_url, 5)
            .await
            .map_err(StoreError::from)?;
        thumbly_store::init_schema(&pool)
            .await
            .map_err(StoreError::from)?;

        let queue = JobQueue::new(config.queue.clone())?;
        queue.init().await?;
        let events = EventBus::new(&config.queue.redis_url)?;

        Ok(Self::new(
            FileStore::new(pool.clone()),
            JobStore::new(pool),
            Arc::new(queue),
            Arc::new(events),
            config,
        ))
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Create and enqueue a job for an uploaded file.
    ///
    /// The file record must already exist and the bytes must be on disk.
    /// Returns the job in `Queued` state.
    pub async fn enqueue_job(&self, user_id: &str, file_id: &FileId) -> WorkerResult<Job> {
        let file = self.files.get_file(file_id).await?;
        if file.user_id != user_id {
            return Err(StoreError::Ownership {
                entity: "File",
                id: file_id.to_string(),
            }
            .into());
        }
        if !file.path.exists() {
            return Err(WorkerError::job_failed(format!(
                "input file not found on disk: {}",
                file.path.display()
            )));
        }

        let job = self
            .jobs
            .create_job(user_id, file_id, vec![self.config.media.size_string()])
            .await?;

        let envelope = ProcessingEnvelope::new(
            job.id.clone(),
            file.id.clone(),
            user_id,
            file.path.clone(),
            file.kind,
            job.thumbnail_sizes.clone(),
            self.config.output_dir.clone(),
        );
        self.queue.enqueue(&envelope, None).await?;
        self.mark_queued(&job.id).await?;

        info!(job_id = %job.id, user_id, file_id = %file_id, "job enqueued");
        self.jobs.get_job(&job.id).await.map_err(Into::into)
    }

    /// Flip a freshly enqueued job to `Queued`. A worker may reserve the
    /// entry first and move the job straight to `Processing`; that race is
    /// not an error.
    async fn mark_queued(&self, job_id: &JobId) -> WorkerResult<()> {
        match self
            .jobs
            .set_status(job_id, JobStatus::Queued, StatusPatch::default())
            .await
        {
            Ok(()) | Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one of the user's jobs.
    pub async fn get_job(&self, user_id: &str, job_id: &JobId) -> WorkerResult<Job> {
        let job = self.jobs.get_job(job_id).await?;
        if job.user_id != user_id {
            return Err(StoreError::Ownership {
                entity: "Job",
                id: job_id.to_string(),
            }
            .into());
        }
        Ok(job)
    }

    /// List the user's jobs, newest first.
    pub async fn list_jobs(&self, user_id: &str) -> WorkerResult<Vec<Job>> {
        self.jobs.list_jobs_by_user(user_id).await.map_err(Into::into)
    }

    /// Re-enqueue a failed job. Resets the record (clearing the error and
    /// timestamps) and puts a fresh entry in the queue.
    pub async fn retry_job(&self, user_id: &str, job_id: &JobId) -> WorkerResult<Job> {
        let job = self.get_job(user_id, job_id).await?;
        let file = self.files.get_file(&job.file_id).await?;

        self.jobs.reset_for_retry(job_id).await?;

        let envelope = ProcessingEnvelope::new(
            job.id.clone(),
            file.id.clone(),
            user_id,
            file.path.clone(),
            file.kind,
            job.thumbnail_sizes.clone(),
            self.config.output_dir.clone(),
        );
        self.queue.enqueue(&envelope, None).await?;
        self.mark_queued(job_id).await?;

        info!(job_id = %job_id, user_id, "job re-enqueued");
        self.jobs.get_job(job_id).await.map_err(Into::into)
    }

    /// Delete one of the user's jobs: the queue entry (if still waiting),
    /// the record, and its thumbnails (cascade).
    pub async fn delete_job(&self, user_id: &str, job_id: &JobId) -> WorkerResult<()> {
        // Ownership check before any destructive step.
        let _job = self.get_job(user_id, job_id).await?;

        self.queue.remove(job_id.as_str()).await?;
        self.jobs.delete_job(job_id).await?;

        info!(job_id = %job_id, user_id, "job deleted");
        Ok(())
    }
}
