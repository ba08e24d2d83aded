//! Media processing configuration.

use std::time::Duration;

/// Media processing configuration.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Square output dimension in pixels
    pub thumbnail_size: u32,
    /// JPEG encoder quality (1-100)
    pub jpeg_quality: u8,
    /// Seek position for video frame extraction (`HH:MM:SS`)
    pub capture_time: String,
    /// Wall-clock limit for the extraction subprocess
    pub extraction_timeout: Duration,
    /// Name or path of the frame-extraction binary
    pub ffmpeg_bin: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 128,
            jpeg_quality: 80,
            capture_time: "00:00:01".to_string(),
            extraction_timeout: Duration::from_secs(60),
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

impl MediaConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            thumbnail_size: std::env::var("THUMBNAIL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.thumbnail_size),
            jpeg_quality: std::env::var("THUMBNAIL_QUALITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.jpeg_quality),
            capture_time: std::env::var("VIDEO_CAPTURE_TIME").unwrap_or(defaults.capture_time),
            extraction_timeout: Duration::from_millis(
                std::env::var("VIDEO_EXTRACTION_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.extraction_timeout.as_millis() as u64),
            ),
            ffmpeg_bin: std::env::var("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
        }
    }

    /// The `WxH` string for the configured square size.
    pub fn size_string(&self) -> String {
        format!("{}x{}", self.thumbnail_size, self.thumbnail_size)
    }
}
