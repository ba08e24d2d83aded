//! In-process raster resize and encode.
//!
//! Cover-fit resizing: the input is scaled to fill the square output and
//! center-cropped, then encoded as JPEG (for JPEG inputs and video frames)
//! or PNG (everything else).

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use tracing::debug;
use uuid::Uuid;

use crate::error::{MediaError, MediaResult};

/// Encoding chosen for the output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    /// File extension for the format.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

/// Probe an image file and choose the output encoding: JPEG inputs stay
/// JPEG, everything else becomes PNG.
pub fn probe_format(path: &Path) -> MediaResult<OutputFormat> {
    let reader = open_reader(path)?;
    match reader.format() {
        Some(ImageFormat::Jpeg) => Ok(OutputFormat::Jpeg),
        Some(_) => Ok(OutputFormat::Png),
        None => Err(MediaError::ProbeFailed(format!(
            "unrecognized image format: {}",
            path.display()
        ))),
    }
}

/// Resize `input` to a `size`x`size` cover-fit thumbnail and write it into
/// `output_dir` as `thumb_<uuid>.{jpg|png}`.
///
/// `force` overrides format probing (the video path always wants JPEG).
/// Returns the output path and dimensions. This is blocking work; callers
/// on the async runtime should wrap it in `spawn_blocking`.
pub fn render_thumbnail(
    input: &Path,
    output_dir: &Path,
    size: u32,
    jpeg_quality: u8,
    force: Option<OutputFormat>,
) -> MediaResult<(PathBuf, u32, u32)> {
    let format = match force {
        Some(format) => format,
        None => probe_format(input)?,
    };

    let img = open_reader(input)?
        .decode()
        .map_err(|e| MediaError::ProbeFailed(e.to_string()))?;

    let thumb = img.resize_to_fill(size, size, FilterType::Lanczos3);

    let output = output_dir.join(format!("thumb_{}.{}", Uuid::new_v4(), format.extension()));
    encode(&thumb, &output, format, jpeg_quality)?;

    // A zero-byte artifact must never pass as a completed thumbnail.
    let written = std::fs::metadata(&output)?.len();
    if written == 0 {
        let _ = std::fs::remove_file(&output);
        return Err(MediaError::EmptyOutput(output));
    }

    debug!(
        "rendered {}x{} thumbnail ({} bytes) at {}",
        thumb.width(),
        thumb.height(),
        written,
        output.display()
    );

    Ok((output, thumb.width(), thumb.height()))
}

fn open_reader(path: &Path) -> MediaResult<ImageReader<std::io::BufReader<File>>> {
    let reader = ImageReader::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MediaError::InputMissing(path.to_path_buf()),
        _ => MediaError::Io(e),
    })?;
    reader.with_guessed_format().map_err(MediaError::Io)
}

fn encode(
    img: &DynamicImage,
    output: &Path,
    format: OutputFormat,
    jpeg_quality: u8,
) -> MediaResult<()> {
    let file = File::create(output)?;
    let mut writer = BufWriter::new(file);

    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut writer, jpeg_quality);
            rgb.write_with_encoder(encoder)
                .map_err(|e| MediaError::EncodeFailed(e.to_string()))?;
        }
        OutputFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut writer,
                CompressionType::Best,
                PngFilterType::Adaptive,
            );
            img.write_with_encoder(encoder)
                .map_err(|e| MediaError::EncodeFailed(e.to_string()))?;
        }
    }

    writer.flush()?;
    Ok(())
}
