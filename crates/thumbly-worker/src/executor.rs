//! Job executor: reserve from the queue, process, persist, publish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use thumbly_media::MediaProcessor;
use thumbly_models::{JobStatus, ThumbnailRecord};
use thumbly_queue::{EventBus, JobQueue, NackOutcome, QueueEntry, QueueError};
use thumbly_store::{JobStore, StatusPatch, StoreError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Shared state for the executor and its spawned job tasks.
struct WorkerContext {
    config: WorkerConfig,
    jobs: JobStore,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
    processor: MediaProcessor,
    consumer_name: String,
    cancel_rx: watch::Receiver<bool>,
}

/// Long-running consumer that drives jobs to a terminal state.
pub struct JobExecutor {
    ctx: Arc<WorkerContext>,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
}

impl JobExecutor {
    /// Create a new executor.
    pub fn new(
        config: WorkerConfig,
        jobs: JobStore,
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown, _) = watch::channel(false);
        let (cancel, cancel_rx) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());
        let processor = MediaProcessor::new(config.media.clone());

        Self {
            ctx: Arc::new(WorkerContext {
                config,
                jobs,
                queue,
                events,
                processor,
                consumer_name,
                cancel_rx,
            }),
            semaphore,
            shutdown,
            cancel,
        }
    }

    /// Signal shutdown. The run loop stops reserving, drains in-flight jobs
    /// up to the drain deadline, then cancels whatever is left so it goes
    /// back through the retry path.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run until shutdown.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            consumer = %self.ctx.consumer_name,
            concurrency = self.ctx.config.concurrency,
            "starting job executor"
        );

        self.ctx.queue.init().await?;
        tokio::fs::create_dir_all(&self.ctx.config.output_dir).await?;

        let mut shutdown_rx = self.shutdown.subscribe();

        // Move due delayed entries (enqueue delays and retry backoff) into
        // the stream.
        let promote_ctx = Arc::clone(&self.ctx);
        let mut promote_shutdown = self.shutdown.subscribe();
        let promoter = tokio::spawn(async move {
            let mut interval = tokio::time::interval(promote_ctx.config.promote_interval);
            loop {
                tokio::select! {
                    _ = promote_shutdown.changed() => {
                        if *promote_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = promote_ctx.queue.promote_due().await {
                            warn!("failed to promote scheduled jobs: {}", e);
                        }
                    }
                }
            }
        });

        // Reclaim reservations that went silent past the stall window.
        let stall_ctx = Arc::clone(&self.ctx);
        let mut stall_shutdown = self.shutdown.subscribe();
        let stall_monitor = tokio::spawn(async move {
            let mut interval = tokio::time::interval(stall_ctx.config.claim_interval);
            loop {
                tokio::select! {
                    _ = stall_shutdown.changed() => {
                        if *stall_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match stall_ctx
                            .queue
                            .claim_stalled(&stall_ctx.consumer_name, 5)
                            .await
                        {
                            Ok(entries) => {
                                for entry in entries {
                                    Self::handle_stalled(&stall_ctx, entry).await;
                                }
                            }
                            Err(e) => warn!("failed to claim stalled jobs: {}", e),
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume() => {
                    if let Err(e) = result {
                        error!("error consuming jobs: {}", e);
                        // Back off on backend errors before retrying reservation.
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        promoter.abort();
        stall_monitor.abort();

        info!("waiting for in-flight jobs to drain");
        let drained = tokio::time::timeout(self.ctx.config.shutdown_drain, self.wait_for_jobs());
        if drained.await.is_err() {
            warn!("drain deadline reached, cancelling in-flight jobs");
            let _ = self.cancel.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), self.wait_for_jobs()).await;
        }

        info!("job executor stopped");
        Ok(())
    }

    /// Reserve and dispatch jobs up to the free concurrency slots.
    async fn consume(&self) -> WorkerResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let entries = self
            .ctx
            .queue
            .reserve(&self.ctx.consumer_name, 1000, available.min(5))
            .await?;

        for entry in entries {
            let ctx = Arc::clone(&self.ctx);
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, entry).await;
            });
        }

        Ok(())
    }

    /// Wait until every concurrency slot is free again.
    async fn wait_for_jobs(&self) {
        loop {
            if self.semaphore.available_permits() == self.ctx.config.concurrency {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Drive one reserved entry to a settled outcome.
    async fn execute_job(ctx: Arc<WorkerContext>, entry: QueueEntry) {
        let job_id = entry.envelope.job_id.clone();
        let logger = JobLogger::new(&job_id, "thumbnail");
        logger.start(&format!("attempt {}", entry.attempt));

        // Single emission point: the worker announces the reservation.
        if let Err(e) = ctx.events.active(&job_id).await {
            warn!(job_id = %job_id, "failed to publish active event: {}", e);
        }

        match Self::run_attempt(&ctx, &entry).await {
            Ok(thumbnails) => {
                match ctx.queue.ack(&entry).await {
                    Ok(()) => {}
                    Err(QueueError::AlreadyAcked(_)) => {
                        logger.warning("entry already settled elsewhere");
                        return;
                    }
                    Err(e) => logger.error(&format!("failed to ack: {}", e)),
                }
                if let Err(e) = ctx.events.completed(&job_id, thumbnails).await {
                    warn!(job_id = %job_id, "failed to publish completed event: {}", e);
                }
                logger.completion("thumbnail generated");
            }
            Err(e) => {
                let message = e.to_string();
                logger.error(&message);

                // Record the failure before settling so observers always
                // see a reason, even while retries remain.
                Self::record_failure(&ctx, &job_id, &message).await;

                if !e.is_retryable() {
                    // Programmer error; consuming the entry is all we can do.
                    match ctx.queue.ack(&entry).await {
                        Ok(()) | Err(QueueError::AlreadyAcked(_)) => {}
                        Err(e) => logger.error(&format!("failed to settle entry: {}", e)),
                    }
                    if let Err(e) = ctx.events.failed(&job_id, message).await {
                        warn!(job_id = %job_id, "failed to publish failed event: {}", e);
                    }
                    return;
                }

                match ctx.queue.nack(&entry, &message).await {
                    Ok(NackOutcome::Retry { delay, attempt }) => {
                        info!(
                            job_id = %job_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "attempt failed, retry scheduled"
                        );
                    }
                    Ok(NackOutcome::Exhausted) => {
                        if let Err(e) = ctx.events.failed(&job_id, message).await {
                            warn!(job_id = %job_id, "failed to publish failed event: {}", e);
                        }
                    }
                    Err(QueueError::AlreadyAcked(_)) => {
                        logger.warning("entry already settled elsewhere");
                    }
                    Err(e) => logger.error(&format!("failed to nack: {}", e)),
                }
            }
        }
    }

    /// One processing attempt: store transitions, media processing under
    /// the job timeout, thumbnail persistence.
    async fn run_attempt(
        ctx: &Arc<WorkerContext>,
        entry: &QueueEntry,
    ) -> WorkerResult<Vec<String>> {
        let envelope = &entry.envelope;
        let job_id = &envelope.job_id;

        let job = ctx.jobs.get_job(job_id).await?;
        if entry.attempt > 1 && job.status == JobStatus::Failed {
            // Clear the previous attempt's failure state before going again.
            ctx.jobs.reset_for_retry(job_id).await?;
        }

        ctx.jobs
            .set_status(job_id, JobStatus::Processing, StatusPatch::processing(10))
            .await?;
        if let Err(e) = ctx.events.progress(job_id, 10).await {
            warn!(job_id = %job_id, "failed to publish progress: {}", e);
        }

        tokio::fs::create_dir_all(&envelope.output_dir).await?;

        // The processor reports progress through a sync callback; forward
        // ticks over a channel to the async refresh/persist/publish side.
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let fwd_ctx = Arc::clone(ctx);
        let fwd_entry = entry.clone();
        let forwarder = tokio::spawn(async move {
            let mut last = 10u8;
            while let Some(progress) = rx.recv().await {
                if progress <= last {
                    continue;
                }
                last = progress;
                let job_id = &fwd_entry.envelope.job_id;
                if let Err(e) = fwd_ctx
                    .queue
                    .update_progress(&fwd_ctx.consumer_name, &fwd_entry)
                    .await
                {
                    warn!(job_id = %job_id, "failed to refresh reservation: {}", e);
                }
                if let Err(e) = fwd_ctx.jobs.update_progress(job_id, progress).await {
                    warn!(job_id = %job_id, "failed to persist progress: {}", e);
                }
                if let Err(e) = fwd_ctx.events.progress(job_id, progress).await {
                    warn!(job_id = %job_id, "failed to publish progress: {}", e);
                }
            }
        });

        let progress = move |p: u8| {
            let _ = tx.send(p);
        };

        let mut cancel_rx = ctx.cancel_rx.clone();
        let process = ctx.processor.process(
            &envelope.file_path,
            envelope.kind,
            &envelope.output_dir,
            progress,
        );

        let result = tokio::select! {
            res = tokio::time::timeout(ctx.config.job_timeout, process) => match res {
                Ok(inner) => inner.map_err(WorkerError::from),
                Err(_) => Err(WorkerError::JobTimeout),
            },
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                Err(WorkerError::job_failed("worker shutting down"))
            }
        };

        // The processing future (and with it the sender) is gone; let the
        // forwarder flush its remaining ticks.
        let _ = forwarder.await;

        let artifact = result?;

        let thumbnail = ThumbnailRecord::new(
            job_id.clone(),
            envelope.file_id.clone(),
            artifact.width,
            artifact.height,
            artifact.path,
            &ctx.config.thumbnail_url_base,
        );
        ctx.jobs.append_thumbnail(&thumbnail).await?;
        ctx.jobs
            .set_status(job_id, JobStatus::Completed, StatusPatch::completed())
            .await?;

        Ok(vec![thumbnail.url_path])
    }

    /// Write the failure reason to the job record, tolerating races with
    /// transitions made by other actors.
    async fn record_failure(ctx: &Arc<WorkerContext>, job_id: &thumbly_models::JobId, message: &str) {
        match ctx
            .jobs
            .set_status(job_id, JobStatus::Failed, StatusPatch::failed(message))
            .await
        {
            Ok(()) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(job_id = %job_id, %from, "skipping failure write, job moved on");
            }
            Err(StoreError::NotFound { .. }) => {
                warn!(job_id = %job_id, "skipping failure write, job deleted");
            }
            Err(e) => error!(job_id = %job_id, "failed to record failure: {}", e),
        }
    }

    /// Settle an entry reclaimed by the stall monitor: the reservation went
    /// silent, so it counts as a failed attempt and goes back through the
    /// retry path.
    async fn handle_stalled(ctx: &Arc<WorkerContext>, entry: QueueEntry) {
        let job_id = entry.envelope.job_id.clone();
        warn!(job_id = %job_id, attempt = entry.attempt, "reclaiming stalled job");

        Self::record_failure(ctx, &job_id, "stalled").await;

        match ctx.queue.nack(&entry, "stalled").await {
            Ok(NackOutcome::Retry { .. }) => {}
            Ok(NackOutcome::Exhausted) => {
                if let Err(e) = ctx.events.failed(&job_id, "stalled").await {
                    warn!(job_id = %job_id, "failed to publish failed event: {}", e);
                }
            }
            Err(QueueError::AlreadyAcked(_)) => {
                debug!(job_id = %job_id, "stalled entry settled by its worker");
            }
            Err(e) => warn!(job_id = %job_id, "failed to nack stalled entry: {}", e),
        }
    }
}
