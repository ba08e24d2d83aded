//! Thumbnail generation entry point.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use thumbly_models::FileKind;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::config::MediaConfig;
use crate::error::{MediaError, MediaResult};
use crate::raster::{render_thumbnail, OutputFormat};

/// One generated artifact on disk.
#[derive(Debug, Clone)]
pub struct ThumbnailArtifact {
    /// Absolute path of the written file
    pub path: PathBuf,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Pure transformation from an input file to a thumbnail artifact.
#[derive(Debug, Clone)]
pub struct MediaProcessor {
    config: MediaConfig,
}

impl MediaProcessor {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Produce one thumbnail for `input` into `output_dir`.
    ///
    /// `progress` receives percentages as the stages complete:
    /// images report 40 then 80; videos report 40, 60 after the frame is
    /// extracted, then 80. The caller owns the 0-10 and 100 endpoints.
    pub async fn process(
        &self,
        input: &Path,
        kind: FileKind,
        output_dir: &Path,
        progress: impl Fn(u8) + Send + Sync,
    ) -> MediaResult<ThumbnailArtifact> {
        if !input.exists() {
            return Err(MediaError::InputMissing(input.to_path_buf()));
        }

        match kind {
            FileKind::Image => self.process_image(input, output_dir, &progress).await,
            FileKind::Video => self.process_video(input, output_dir, &progress).await,
        }
    }

    async fn process_image(
        &self,
        input: &Path,
        output_dir: &Path,
        progress: &(impl Fn(u8) + Send + Sync),
    ) -> MediaResult<ThumbnailArtifact> {
        progress(40);
        let artifact = self.render(input, output_dir, None).await?;
        progress(80);
        Ok(artifact)
    }

    /// Run the blocking resize/encode off the async runtime.
    async fn render(
        &self,
        input: &Path,
        output_dir: &Path,
        force: Option<OutputFormat>,
    ) -> MediaResult<ThumbnailArtifact> {
        let input = input.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        let size = self.config.thumbnail_size;
        let quality = self.config.jpeg_quality;

        let (path, width, height) = tokio::task::spawn_blocking(move || {
            render_thumbnail(&input, &output_dir, size, quality, force)
        })
        .await
        .map_err(|e| MediaError::internal(format!("raster task failed: {e}")))??;

        Ok(ThumbnailArtifact {
            path,
            width,
            height,
        })
    }

    async fn process_video(
        &self,
        input: &Path,
        output_dir: &Path,
        progress: &(impl Fn(u8) + Send + Sync),
    ) -> MediaResult<ThumbnailArtifact> {
        progress(40);

        let frame = output_dir.join(format!("temp_{}.jpg", Uuid::new_v4()));

        let cmd = FfmpegCommand::new(input, &frame)
            .seek(self.config.capture_time.clone())
            .single_frame()
            .format("image2");

        let result = FfmpegRunner::new(self.config.ffmpeg_bin.clone())
            .with_timeout(self.config.extraction_timeout)
            .run(&cmd)
            .await;

        if let Err(e) = result {
            // ffmpeg may leave a partial destination behind.
            let _ = std::fs::remove_file(&frame);
            return Err(e);
        }

        debug!("extracted frame at {}", frame.display());
        progress(60);

        let artifact = self
            .render(&frame, output_dir, Some(OutputFormat::Jpeg))
            .await;

        if let Err(e) = tokio::fs::remove_file(&frame).await {
            warn!("failed to remove temporary frame {}: {}", frame.display(), e);
        }

        let artifact = artifact?;
        progress(80);
        Ok(artifact)
    }
}
