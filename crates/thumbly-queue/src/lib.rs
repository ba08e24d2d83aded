//! Durable job queue and event fan-out on Redis.
//!
//! This crate provides:
//! - Job enqueueing via Redis Streams with per-job dedup
//! - Delayed scheduling and exponential retry backoff via a sorted set
//! - Worker consumption with stall reclaim
//! - Lifecycle events via Redis Pub/Sub

pub mod envelope;
pub mod error;
pub mod events;
pub mod queue;

pub use envelope::ProcessingEnvelope;
pub use error::{QueueError, QueueResult};
pub use events::EventBus;
pub use queue::{backoff_delay, CleanKind, JobQueue, NackOutcome, QueueConfig, QueueEntry};
