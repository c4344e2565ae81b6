// source.rs — Sequential reader of fixed-size raw frames.
//
// The input file is a bare concatenation of frames with no header and no
// delimiter; the byte size of a frame must be known a priori (see
// `FrameFormat::frame_bytes`).
//
// END OF STREAM
// ─────────────
// End of stream is a normal terminal condition, not an error. A trailing
// block shorter than one frame is also treated as end of stream. Once the
// source has reported end of stream it stays exhausted: later calls return
// `Ok(false)` without touching the reader or the caller's buffer, until a
// new source is opened with `reopen`.
//
// To leave the caller's buffer untouched on a short read, each frame is
// first read into a staging vector owned by the source and only published
// (by swapping storage, not copying) once it is complete. Both vectors are
// allocated once per session.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::frame::FrameBuffer;

/// Errors from opening or reading a frame stream.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("frame source not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("cannot open frame source {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("frame size must be non-zero")]
    ZeroFrameSize,
    #[error("frame size mismatch: source reads {expected} bytes per frame, buffer holds {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("read error after {frames} frames: {source}")]
    Read {
        frames: u64,
        #[source]
        source: io::Error,
    },
}

/// A stream of fixed-size frames.
///
/// Generic over the reader so tests can stream from memory; `open` builds
/// the file-backed variant.
pub struct FrameSource<R: Read = BufReader<File>> {
    reader: R,
    frame_bytes: usize,
    staging: Vec<u8>,
    frames_read: u64,
    exhausted: bool,
}

impl FrameSource<BufReader<File>> {
    /// Open a raw frame file.
    ///
    /// # Errors
    /// `SourceError::FileNotFound` if the path does not exist, `Open` for
    /// any other I/O failure.
    pub fn open(path: impl AsRef<Path>, frame_bytes: usize) -> Result<Self, SourceError> {
        let path = path.as_ref();
        if frame_bytes == 0 {
            return Err(SourceError::ZeroFrameSize);
        }
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SourceError::FileNotFound(path.to_path_buf()),
            _ => SourceError::Open { path: path.to_path_buf(), source: e },
        })?;
        info!("opened frame source {} ({frame_bytes} bytes/frame)", path.display());
        Self::from_reader(BufReader::new(file), frame_bytes)
    }

    /// Replace the underlying file with a new one and reset the
    /// end-of-stream state. The staging buffer is kept.
    pub fn reopen(&mut self, path: impl AsRef<Path>) -> Result<(), SourceError> {
        let fresh = Self::open(path, self.frame_bytes)?;
        self.reader = fresh.reader;
        self.frames_read = 0;
        self.exhausted = false;
        Ok(())
    }
}

impl<R: Read> FrameSource<R> {
    /// Stream frames of `frame_bytes` bytes out of `reader`.
    ///
    /// # Errors
    /// `SourceError::ZeroFrameSize` if `frame_bytes` is zero.
    pub fn from_reader(reader: R, frame_bytes: usize) -> Result<Self, SourceError> {
        if frame_bytes == 0 {
            return Err(SourceError::ZeroFrameSize);
        }
        Ok(FrameSource {
            reader,
            frame_bytes,
            staging: vec![0u8; frame_bytes],
            frames_read: 0,
            exhausted: false,
        })
    }

    /// Read the next frame into `buf`.
    ///
    /// Returns `Ok(true)` when a complete frame was stored in `buf`, and
    /// `Ok(false)` at end of stream, in which case `buf` is unmodified.
    pub fn read_next_frame(&mut self, buf: &mut FrameBuffer) -> Result<bool, SourceError> {
        if buf.as_slice().len() != self.frame_bytes {
            return Err(SourceError::SizeMismatch {
                expected: self.frame_bytes,
                actual: buf.as_slice().len(),
            });
        }
        if self.exhausted {
            return Ok(false);
        }

        let filled = self.fill_staging()?;
        if filled < self.frame_bytes {
            if filled > 0 {
                warn!(
                    "discarding trailing partial frame ({filled} of {} bytes)",
                    self.frame_bytes
                );
            }
            debug!("end of stream after {} frames", self.frames_read);
            self.exhausted = true;
            return Ok(false);
        }

        buf.swap_storage(&mut self.staging);
        self.frames_read += 1;
        Ok(true)
    }

    /// Frames successfully delivered since the source was opened.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// True once end of stream has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Read until the staging buffer is full or the reader hits EOF.
    /// Returns the number of bytes filled.
    fn fill_staging(&mut self) -> Result<usize, SourceError> {
        let mut filled = 0;
        while filled < self.frame_bytes {
            match self.reader.read(&mut self.staging[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(SourceError::Read { frames: self.frames_read, source: e })
                }
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFormat, PixelLayout};
    use std::io::Cursor;

    fn gray(w: u32, h: u32) -> FrameFormat {
        FrameFormat::new(w, h, PixelLayout::Gray8)
    }

    #[test]
    fn test_reads_consecutive_frames() {
        let fmt = gray(2, 2);
        let data: Vec<u8> = (0..8).collect();
        let mut src = FrameSource::from_reader(Cursor::new(data), fmt.frame_bytes()).unwrap();
        let mut buf = FrameBuffer::new(fmt);

        assert!(src.read_next_frame(&mut buf).unwrap());
        assert_eq!(buf.as_slice(), &[0, 1, 2, 3]);
        assert!(src.read_next_frame(&mut buf).unwrap());
        assert_eq!(buf.as_slice(), &[4, 5, 6, 7]);
        assert_eq!(src.frames_read(), 2);
        assert!(!src.read_next_frame(&mut buf).unwrap());
        assert!(src.is_exhausted());
    }

    #[test]
    fn test_partial_trailing_frame_leaves_buffer() {
        let fmt = gray(2, 2);
        let data: Vec<u8> = vec![1, 1, 1, 1, 9, 9];
        let mut src = FrameSource::from_reader(Cursor::new(data), fmt.frame_bytes()).unwrap();
        let mut buf = FrameBuffer::new(fmt);

        assert!(src.read_next_frame(&mut buf).unwrap());
        assert!(!src.read_next_frame(&mut buf).unwrap());
        assert_eq!(buf.as_slice(), &[1, 1, 1, 1]);
    }

    #[test]
    fn test_size_mismatch() {
        let mut src = FrameSource::from_reader(Cursor::new(vec![0u8; 16]), 4).unwrap();
        let mut buf = FrameBuffer::new(gray(3, 3));
        let err = src.read_next_frame(&mut buf).unwrap_err();
        assert!(matches!(err, SourceError::SizeMismatch { expected: 4, actual: 9 }));
    }

    #[test]
    fn test_zero_frame_size_is_rejected() {
        let err = FrameSource::from_reader(Cursor::new(vec![0u8; 4]), 0).err();
        assert!(matches!(err, Some(SourceError::ZeroFrameSize)));
        let err = FrameSource::open("/nonexistent/quadframe/frames.rgb", 0).err();
        assert!(matches!(err, Some(SourceError::ZeroFrameSize)));
    }

    #[test]
    fn test_open_missing_file() {
        let err = FrameSource::open("/nonexistent/quadframe/frames.rgb", 12)
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, SourceError::FileNotFound(_)));
    }
}
