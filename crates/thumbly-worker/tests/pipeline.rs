//! End-to-end pipeline tests.
//!
//! These need a live Redis at `REDIS_URL` (default `redis://localhost:6379`)
//! and are ignored by default. Run with `cargo test -- --ignored`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use image::GenericImageView;
use tempfile::TempDir;

use thumbly_media::MediaConfig;
use thumbly_models::{FileKind, FileRecord, Job, JobEvent, JobId, JobStatus};
use thumbly_queue::QueueConfig;
use thumbly_worker::{JobExecutor, Pipeline, WorkerConfig};

struct Harness {
    pipeline: Arc<Pipeline>,
    executor: Arc<JobExecutor>,
    events: Arc<Mutex<Vec<JobEvent>>>,
    dir: TempDir,
}

async fn harness(suffix: &str) -> Harness {
    harness_with(suffix, |_| {}).await
}

async fn harness_with(suffix: &str, tweak: impl FnOnce(&mut WorkerConfig)) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let unique = format!("{}-{}", suffix, uuid::Uuid::new_v4());

    let config = WorkerConfig {
        concurrency: 1,
        job_timeout: Duration::from_secs(20),
        shutdown_drain: Duration::from_secs(5),
        promote_interval: Duration::from_millis(100),
        claim_interval: Duration::from_secs(60),
        upload_dir: dir.path().join("uploads"),
        output_dir: dir.path().join("uploads/thumbnails"),
        thumbnail_url_base: "/uploads/thumbnails".to_string(),
        database_url: format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display()),
        queue: QueueConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_name: format!("thumbly-e2e:jobs:{}", unique),
            consumer_group: "thumbly-e2e:workers".to_string(),
            scheduled_key: format!("thumbly-e2e:scheduled:{}", unique),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(20),
        },
        media: MediaConfig {
            thumbnail_size: 64,
            ..MediaConfig::default()
        },
    };

    let mut config = config;
    tweak(&mut config);

    let pipeline = Arc::new(Pipeline::connect(config.clone()).await.expect("pipeline"));

    // Subscribe before any job runs so no event is missed.
    let stream = pipeline.events().subscribe_all().await.expect("subscribe");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(event) = stream.next().await {
            sink.lock().unwrap().push(event);
        }
    });

    let executor = Arc::new(JobExecutor::new(
        config,
        pipeline.jobs().clone(),
        Arc::clone(pipeline.queue()),
        Arc::clone(pipeline.events()),
    ));

    Harness {
        pipeline,
        executor,
        events,
        dir,
    }
}

impl Harness {
    fn start(&self) -> tokio::task::JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let _ = executor.run().await;
        })
    }

    async fn stop(&self, handle: tokio::task::JoinHandle<()>) {
        self.executor.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    async fn upload_image(&self, user_id: &str, name: &str) -> FileRecord {
        let uploads = self.dir.path().join("uploads");
        tokio::fs::create_dir_all(&uploads).await.unwrap();
        let path = uploads.join(name);
        write_jpeg(&path, 640, 480);

        let file = FileRecord::new(
            user_id,
            name,
            name,
            "image/jpeg",
            std::fs::metadata(&path).unwrap().len(),
            &path,
            FileKind::Image,
        );
        self.pipeline.files().create_file(&file).await.unwrap();
        file
    }

    async fn wait_terminal(&self, user_id: &str, job_id: &JobId, timeout: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.pipeline.get_job(user_id, job_id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} did not reach a terminal state in time (status {})",
                job_id,
                job.status
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn events_for(&self, job_id: &JobId) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_id() == job_id)
            .cloned()
            .collect()
    }

    /// Wait for the terminal `job-failed` event. The store shows transient
    /// `failed` states between attempts, so the event is the reliable
    /// "all attempts exhausted" signal.
    async fn wait_for_failed_event(&self, job_id: &JobId, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .events_for(job_id)
                .iter()
                .any(|e| matches!(e, JobEvent::Failed(_)))
            {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} produced no failed event in time",
                job_id
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn write_jpeg(path: &Path, width: u32, height: u32) {
    image::RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 64]))
        .save_with_format(path, image::ImageFormat::Jpeg)
        .unwrap();
}

fn active_count(events: &[JobEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, JobEvent::Active(_)))
        .count()
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn happy_image_path() {
    let h = harness("happy").await;
    let file = h.upload_image("user-1", "input.jpg").await;

    let handle = h.start();
    let job = h.pipeline.enqueue_job("user-1", &file.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let done = h
        .wait_terminal("user-1", &job.id, Duration::from_secs(15))
        .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.thumbnails.len(), 1);
    assert!(done.error.is_none());
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());

    // The artifact is a real 64x64 image on disk.
    let thumb = &done.thumbnails[0];
    assert!(thumb.url_path.starts_with("/uploads/thumbnails/thumb_"));
    let on_disk = image::open(&thumb.path).unwrap();
    assert_eq!((on_disk.width(), on_disk.height()), (64, 64));
    assert!(std::fs::metadata(&thumb.path).unwrap().len() > 0);

    // Give the pub/sub fanout a beat, then check the sequence.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = h.events_for(&job.id);
    assert_eq!(active_count(&events), 1);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) => Some(p.progress),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "monotonic");
    assert!(progress.contains(&10));
    assert!(progress.contains(&40));
    assert!(progress.contains(&80));

    match events.last().unwrap() {
        JobEvent::Completed(e) => {
            assert_eq!(e.progress, 100);
            assert_eq!(e.returnvalue.thumbnails, vec![thumb.url_path.clone()]);
        }
        other => panic!("expected completed event, got {:?}", other),
    }

    h.stop(handle).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn missing_input_exhausts_attempts() {
    let h = harness("missing").await;
    let file = h.upload_image("user-1", "vanishing.jpg").await;

    // The file disappears between upload and processing.
    let job = h.pipeline.enqueue_job("user-1", &file.id).await.unwrap();
    std::fs::remove_file(&file.path).unwrap();

    let handle = h.start();
    h.wait_for_failed_event(&job.id, Duration::from_secs(15)).await;

    let done = h.pipeline.get_job("user-1", &job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("not found"));
    assert!(done.thumbnails.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = h.events_for(&job.id);
    assert_eq!(active_count(&events), 3, "one active event per attempt");
    let failed: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Failed(_)))
        .collect();
    assert_eq!(failed.len(), 1, "single terminal failed event");

    h.stop(handle).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn fifo_order_at_concurrency_one() {
    let h = harness("fifo").await;
    let file_a = h.upload_image("user-1", "a.jpg").await;
    let file_b = h.upload_image("user-1", "b.jpg").await;
    let file_c = h.upload_image("user-1", "c.jpg").await;

    let job_a = h.pipeline.enqueue_job("user-1", &file_a.id).await.unwrap();
    let job_b = h.pipeline.enqueue_job("user-1", &file_b.id).await.unwrap();
    let job_c = h.pipeline.enqueue_job("user-1", &file_c.id).await.unwrap();

    let handle = h.start();
    let a = h
        .wait_terminal("user-1", &job_a.id, Duration::from_secs(20))
        .await;
    let b = h
        .wait_terminal("user-1", &job_b.id, Duration::from_secs(20))
        .await;
    let c = h
        .wait_terminal("user-1", &job_c.id, Duration::from_secs(20))
        .await;

    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    assert!(b.completed_at.unwrap() <= c.started_at.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let actives: Vec<JobId> = h
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            JobEvent::Active(e) => Some(e.job_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(actives, vec![job_a.id, job_b.id, job_c.id]);

    h.stop(handle).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn user_retry_after_terminal_failure() {
    // One attempt per enqueue so the first failure is immediately terminal.
    let h = harness_with("retry", |c| c.queue.max_attempts = 1).await;
    let file = h.upload_image("user-1", "flaky.jpg").await;
    let original: PathBuf = file.path.clone();
    let stash = h.dir.path().join("stash.jpg");

    let job = h.pipeline.enqueue_job("user-1", &file.id).await.unwrap();
    std::fs::rename(&original, &stash).unwrap();

    let handle = h.start();
    h.wait_for_failed_event(&job.id, Duration::from_secs(15)).await;
    let failed = h.pipeline.get_job("user-1", &job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    // The user restores the input and retries.
    std::fs::rename(&stash, &original).unwrap();
    let retried = h.pipeline.retry_job("user-1", &job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert!(retried.error.is_none());

    let done = h
        .wait_terminal("user-1", &job.id, Duration::from_secs(15))
        .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.error.is_none());
    assert_eq!(done.thumbnails.len(), 1);

    h.stop(handle).await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn delete_before_processing_empties_queue() {
    let h = harness("delete").await;
    let file = h.upload_image("user-1", "doomed.jpg").await;

    // No executor running: the entry stays in the waiting set.
    let job = h.pipeline.enqueue_job("user-1", &file.id).await.unwrap();
    h.pipeline.delete_job("user-1", &job.id).await.unwrap();

    assert!(h.pipeline.get_job("user-1", &job.id).await.is_err());
    assert_eq!(h.pipeline.queue().len().await.unwrap(), 0);

    // The job id is free again for a fresh enqueue of the same file.
    let again = h.pipeline.enqueue_job("user-1", &file.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Queued);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn foreign_user_cannot_touch_jobs() {
    let h = harness("owner").await;
    let file = h.upload_image("user-1", "private.jpg").await;
    let job = h.pipeline.enqueue_job("user-1", &file.id).await.unwrap();

    assert!(h.pipeline.get_job("user-2", &job.id).await.is_err());
    assert!(h.pipeline.delete_job("user-2", &job.id).await.is_err());
    assert!(h.pipeline.retry_job("user-2", &job.id).await.is_err());
}
