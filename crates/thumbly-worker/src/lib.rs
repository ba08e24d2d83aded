//! Thumbnail generation worker.
//!
//! This crate provides:
//! - The job executor: reserve, process, persist, publish
//! - The pipeline facade used by the upload boundary (enqueue, list,
//!   inspect, retry, delete)
//! - Graceful shutdown with a drain deadline

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use pipeline::Pipeline;
