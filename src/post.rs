// post.rs — Post-processing bridge between GPU read-back and image files.
//
// The GPU side hands over raw RGBA8 rows in bottom-up order. This module
// wraps them as `image` buffers, flips them to top-down, and encodes or
// dumps them. Flip and encode are the only operations it needs from the
// image library.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use log::debug;
use thiserror::Error;

use crate::frame::{FrameBuffer, PixelLayout};

#[derive(Debug, Error)]
pub enum PostError {
    #[error("pixel buffer of {len} bytes does not hold a {width}×{height} image")]
    BadDimensions { width: u32, height: u32, len: usize },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-frame timings of one render step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTiming {
    pub upload: Duration,
    pub draw: Duration,
    pub readback: Duration,
    pub flip: Duration,
}

impl FrameTiming {
    /// Sum of all stages.
    pub fn total(&self) -> Duration {
        self.upload + self.draw + self.readback + self.flip
    }

    /// Accumulate another frame's timings.
    pub fn accumulate(&mut self, other: &FrameTiming) {
        self.upload += other.upload;
        self.draw += other.draw;
        self.readback += other.readback;
        self.flip += other.flip;
    }
}

/// Wrap read-back pixels as an RGBA image (rows in the order given).
pub fn to_rgba_image(pixels: Vec<u8>, width: u32, height: u32) -> Result<RgbaImage, PostError> {
    let len = pixels.len();
    RgbaImage::from_raw(width, height, pixels).ok_or(PostError::BadDimensions { width, height, len })
}

/// Wrap a host frame as a dynamic image of its own layout.
pub fn frame_to_image(frame: &FrameBuffer) -> Result<DynamicImage, PostError> {
    let (width, height) = (frame.width(), frame.height());
    let data = frame.as_slice().to_vec();
    let len = data.len();
    let bad = || PostError::BadDimensions { width, height, len };
    Ok(match frame.format().layout {
        PixelLayout::Gray8 => DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, data).ok_or_else(bad)?),
        PixelLayout::Rgb8 => DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).ok_or_else(bad)?),
        PixelLayout::Rgba8 => DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, data).ok_or_else(bad)?),
    })
}

/// Vertical flip: bottom-up rows become top-down and vice versa.
pub fn flip(image: &RgbaImage) -> RgbaImage {
    image::imageops::flip_vertical(image)
}

/// `flip`, returning the time it took.
pub fn flip_timed(image: &RgbaImage) -> (RgbaImage, Duration) {
    let t = Instant::now();
    let flipped = flip(image);
    (flipped, t.elapsed())
}

/// Encode to the format implied by the file extension. JPEG drops alpha.
pub fn encode(image: &DynamicImage, path: &Path) -> Result<(), PostError> {
    let is_jpeg = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
    let result = if is_jpeg && image.color().has_alpha() {
        DynamicImage::ImageRgb8(image.to_rgb8()).save(path)
    } else {
        image.save(path)
    };
    result.map_err(|source| PostError::Encode { path: path.to_path_buf(), source })?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// Write raw bytes (no header).
pub fn write_raw(bytes: &[u8], path: &Path) -> Result<(), PostError> {
    fs::write(path, bytes).map_err(|source| PostError::Io { path: path.to_path_buf(), source })?;
    debug!("wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}
