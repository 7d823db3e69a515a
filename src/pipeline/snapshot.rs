//! Frame snapshots written to image files

use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::capture::format;
use crate::capture::Frame;
use crate::error::DeviceError;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Format(#[from] DeviceError),

    #[error("frame holds {actual} bytes, {expected} expected")]
    Truncated { expected: usize, actual: usize },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reorder a frame's pixels into RGB according to its format's channel layout.
pub fn to_rgb_image(frame: &Frame) -> Result<RgbImage, SnapshotError> {
    let format = format::find(frame.meta.fourcc)?;
    let bpp = format.bytes_per_pixel();
    let stride = frame.meta.stride as usize;
    let (width, height) = (frame.meta.width, frame.meta.height);

    let expected = stride * height as usize;
    if frame.data.len() < expected || stride < width as usize * bpp {
        return Err(SnapshotError::Truncated {
            expected,
            actual: frame.data.len(),
        });
    }

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let offset = y as usize * stride + x as usize * bpp;
        let color = format.read_pixel(&frame.data[offset..offset + bpp]);
        image::Rgb([color.r, color.g, color.b])
    }))
}

/// File name used for the frame with the given sequence number.
pub fn frame_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("image{}.bmp", sequence))
}

/// Write a frame as a BMP file.
pub fn write_frame(frame: &Frame, path: &Path) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    to_rgb_image(frame)?.save_with_format(path, ImageFormat::Bmp)?;
    debug!("Frame {} written to {}", frame.meta.sequence, path.display());
    Ok(())
}
