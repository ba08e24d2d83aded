//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use thumbly_media::MediaConfig;
use thumbly_queue::QueueConfig;

/// Worker configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parallel workers in this process; 1 gives strict FIFO
    pub concurrency: usize,
    /// Wall-clock limit for one processing attempt
    pub job_timeout: Duration,
    /// How long to wait for in-flight jobs on shutdown
    pub shutdown_drain: Duration,
    /// How often due delayed entries are promoted into the stream
    pub promote_interval: Duration,
    /// How often the stall monitor scans for silent reservations
    pub claim_interval: Duration,
    /// Root directory for original uploads
    pub upload_dir: PathBuf,
    /// Directory for generated artifacts
    pub output_dir: PathBuf,
    /// Server-relative URL prefix for artifacts
    pub thumbnail_url_base: String,
    /// SQLite URL for the job store
    pub database_url: String,
    /// Queue settings (stream names, retry policy)
    pub queue: QueueConfig,
    /// Media settings (size, quality, capture time)
    pub media: MediaConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let upload_dir = PathBuf::from("uploads");
        Self {
            concurrency: 1,
            job_timeout: Duration::from_secs(300),
            shutdown_drain: Duration::from_secs(30),
            promote_interval: Duration::from_secs(1),
            claim_interval: Duration::from_secs(60),
            output_dir: upload_dir.join("thumbnails"),
            upload_dir,
            thumbnail_url_base: "/uploads/thumbnails".to_string(),
            database_url: "sqlite:thumbly.db?mode=rwc".to_string(),
            queue: QueueConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);
        let output_dir = std::env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| upload_dir.join("thumbnails"));

        Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.concurrency),
            job_timeout: Duration::from_millis(
                std::env::var("JOB_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.job_timeout.as_millis() as u64),
            ),
            shutdown_drain: Duration::from_millis(
                std::env::var("SHUTDOWN_DRAIN_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.shutdown_drain.as_millis() as u64),
            ),
            promote_interval: Duration::from_millis(
                std::env::var("PROMOTE_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.promote_interval.as_millis() as u64),
            ),
            claim_interval: Duration::from_millis(
                std::env::var("CLAIM_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.claim_interval.as_millis() as u64),
            ),
            upload_dir,
            output_dir,
            thumbnail_url_base: std::env::var("THUMBNAIL_URL_BASE")
                .unwrap_or(defaults.thumbnail_url_base),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            queue: QueueConfig::from_env(),
            media: MediaConfig::from_env(),
        }
    }
}
