//! Media processing: one input file in, one thumbnail artifact out.
//!
//! This crate provides:
//! - In-process raster resize/encode for images (`image` crate)
//! - External frame extraction for videos (ffmpeg subprocess with a hard
//!   timeout), piped through the same raster path
//! - A single `MediaProcessor::process` entry point with progress reporting

pub mod command;
pub mod config;
pub mod error;
pub mod processor;
pub mod raster;

pub use command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
pub use config::MediaConfig;
pub use error::{MediaError, MediaResult};
pub use processor::{MediaProcessor, ThumbnailArtifact};
pub use raster::{probe_format, render_thumbnail, OutputFormat};
