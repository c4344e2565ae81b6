// frame.rs — Host-side frame formats and the reusable frame buffer.
//
// A raw stream carries no header, so everything about a frame is known out
// of band: width, height and the pixel layout. `FrameFormat` bundles those
// three and derives the byte size that the frame source reads per step.
//
// Memory layout of an RGB24 frame (width = 3):
//
//   byte:   0 1 2 | 3 4 5 | 6 7 8 | 9 ...
//   pixel:  R G B | R G B | R G B | R (row 1) ...
//           |---------- row 0 -----------|
//
// Rows are tightly packed (no stride padding) and ordered top-down, which
// is how the frames are produced by the capture side. Device read-back is
// bottom-up; see `flip_rows_in_place`.

use std::fmt;

// ---------------------------------------------------------------------------
// PixelLayout
// ---------------------------------------------------------------------------

/// Channel layout of one pixel in a raw frame. All channels are 8-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Single luminance channel.
    Gray8,
    /// Packed R, G, B.
    Rgb8,
    /// Packed R, G, B, A.
    Rgba8,
}

impl PixelLayout {
    /// Bytes occupied by one pixel.
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
            PixelLayout::Rgba8 => 4,
        }
    }

    /// Map a channel count to a layout. Returns `None` for counts other
    /// than 1, 3 or 4.
    pub fn from_channels(channels: usize) -> Option<Self> {
        match channels {
            1 => Some(PixelLayout::Gray8),
            3 => Some(PixelLayout::Rgb8),
            4 => Some(PixelLayout::Rgba8),
            _ => None,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Gray8 => write!(f, "gray8"),
            PixelLayout::Rgb8 => write!(f, "rgb24"),
            PixelLayout::Rgba8 => write!(f, "rgba32"),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameFormat
// ---------------------------------------------------------------------------

/// Dimensions and layout of every frame in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        FrameFormat { width, height, layout }
    }

    /// Bytes in one row.
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel()
    }

    /// Bytes in one frame: width × height × bytes-per-pixel.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Number of pixels.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} {}", self.width, self.height, self.layout)
    }
}

// ---------------------------------------------------------------------------
// FrameBuffer
// ---------------------------------------------------------------------------

/// A reusable host buffer holding exactly one frame.
///
/// Allocated once per streaming session and refilled in place every step.
/// The length never changes after construction, so the frame source can
/// swap its staging storage with the buffer without reallocating.
pub struct FrameBuffer {
    data: Vec<u8>,
    format: FrameFormat,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer for `format`.
    pub fn new(format: FrameFormat) -> Self {
        FrameBuffer {
            data: vec![0u8; format.frame_bytes()],
            format,
        }
    }

    /// Wrap existing pixel data.
    ///
    /// # Panics
    /// Panics if `data.len()` is not the frame size of `format`.
    pub fn from_vec(format: FrameFormat, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            format.frame_bytes(),
            "data length ({}) must equal frame size ({}) for {format}",
            data.len(),
            format.frame_bytes(),
        );
        FrameBuffer { data, format }
    }

    #[inline]
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.format.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.format.height
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Borrow row `y` (top-down).
    pub fn row(&self, y: usize) -> &[u8] {
        assert!(
            y < self.format.height as usize,
            "row {y} out of bounds (height {})",
            self.format.height
        );
        let rb = self.format.row_bytes();
        &self.data[y * rb..(y + 1) * rb]
    }

    /// Exchange the backing storage with `other`. Both must be one frame
    /// long; used by the frame source to publish a completely read frame.
    pub(crate) fn swap_storage(&mut self, other: &mut Vec<u8>) {
        debug_assert_eq!(other.len(), self.data.len());
        std::mem::swap(&mut self.data, other);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pixel helpers
// ---------------------------------------------------------------------------

/// Reverse the order of the rows of a tightly packed buffer in place.
///
/// Device read-back returns rows bottom-up; consumers expect top-down.
/// Applying the flip twice restores the original buffer exactly.
///
/// # Panics
/// Panics if `row_bytes` is zero or does not divide `buf.len()`.
pub fn flip_rows_in_place(buf: &mut [u8], row_bytes: usize) {
    assert!(row_bytes > 0, "row_bytes must be > 0");
    assert_eq!(
        buf.len() % row_bytes,
        0,
        "buffer length ({}) is not a multiple of row_bytes ({row_bytes})",
        buf.len()
    );
    let rows = buf.len() / row_bytes;
    for y in 0..rows / 2 {
        // Split so the two rows can be borrowed mutably at the same time.
        let (top, bottom) = buf.split_at_mut((rows - 1 - y) * row_bytes);
        top[y * row_bytes..(y + 1) * row_bytes].swap_with_slice(&mut bottom[..row_bytes]);
    }
}

/// Expand a frame of any layout into RGBA8, writing into `dst`.
///
/// Gray replicates luminance into R, G and B (the luminance texture
/// convention). Alpha is always 255 for layouts without one.
///
/// # Panics
/// Panics if `src` or `dst` do not hold exactly `pixels` pixels.
pub fn expand_to_rgba8(src: &[u8], layout: PixelLayout, pixels: usize, dst: &mut [u8]) {
    assert_eq!(src.len(), pixels * layout.bytes_per_pixel(), "source size mismatch");
    assert_eq!(dst.len(), pixels * 4, "destination size mismatch");
    match layout {
        PixelLayout::Rgba8 => dst.copy_from_slice(src),
        PixelLayout::Rgb8 => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                d[..3].copy_from_slice(s);
                d[3] = 255;
            }
        }
        PixelLayout::Gray8 => {
            for (d, &l) in dst.chunks_exact_mut(4).zip(src.iter()) {
                d[0] = l;
                d[1] = l;
                d[2] = l;
                d[3] = 255;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
