//! Shared data models for the thumbly backend.
//!
//! This crate provides Serde-serializable types for:
//! - Files, jobs, and thumbnail artifacts
//! - Job lifecycle states and the legal transition graph
//! - Event bus message schemas

pub mod event;
pub mod file;
pub mod job;
pub mod thumbnail;

// Re-export common types
pub use event::{
    ActiveEvent, CompletedEvent, CompletedValue, FailedEvent, JobEvent, ProgressEvent, Topic,
};
pub use file::{FileId, FileKind, FileRecord};
pub use job::{Job, JobId, JobStatus};
pub use thumbnail::{ThumbnailId, ThumbnailRecord};
