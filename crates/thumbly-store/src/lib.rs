//! Durable job store backed by SQLite.
//!
//! This crate provides:
//! - Connection pool setup with WAL mode and foreign keys
//! - CRUD over files, jobs, and thumbnails
//! - Lifecycle transition validation at the record level

pub mod db;
pub mod error;
pub mod files;
pub mod jobs;

pub use db::{connect, init_schema};
pub use error::{StoreError, StoreResult};
pub use files::FileStore;
pub use jobs::{JobStore, StatusPatch};
