// tests/test_source.rs — Frame source end-of-stream behaviour.
//
// Run with `cargo test --test test_source`.

use std::fs;
use std::io::Cursor;
use std::path::PathBuf;

use quadframe::frame::{FrameBuffer, FrameFormat, PixelLayout};
use quadframe::source::{FrameSource, SourceError};

fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("quadframe-source-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn frames_arrive_in_order() {
    let fmt = FrameFormat::new(2, 1, PixelLayout::Rgb8);
    let data: Vec<u8> = (0..18).collect();
    let mut src = FrameSource::from_reader(Cursor::new(data), fmt.frame_bytes()).unwrap();
    let mut buf = FrameBuffer::new(fmt);

    for i in 0..3u8 {
        assert!(src.read_next_frame(&mut buf).unwrap());
        assert_eq!(buf.as_slice()[0], i * 6);
    }
    assert!(!src.read_next_frame(&mut buf).unwrap());
    assert_eq!(src.frames_read(), 3);
}

#[test]
fn exhausted_source_leaves_buffer_unchanged() {
    let fmt = FrameFormat::new(4, 1, PixelLayout::Gray8);
    // One full frame plus a 2-byte tail.
    let mut src = FrameSource::from_reader(Cursor::new(vec![1, 2, 3, 4, 9, 9]), 4).unwrap();
    let mut buf = FrameBuffer::new(fmt);

    assert!(src.read_next_frame(&mut buf).unwrap());
    assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);

    for _ in 0..3 {
        assert!(!src.read_next_frame(&mut buf).unwrap());
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }
    assert!(src.is_exhausted());
}

#[test]
fn reopen_resets_end_of_stream() {
    let fmt = FrameFormat::new(2, 2, PixelLayout::Gray8);
    let first = temp_file("first.gray", &[1, 1, 1, 1]);
    let second = temp_file("second.gray", &[2, 2, 2, 2, 3, 3, 3, 3]);

    let mut src = FrameSource::open(&first, fmt.frame_bytes()).unwrap();
    let mut buf = FrameBuffer::new(fmt);
    assert!(src.read_next_frame(&mut buf).unwrap());
    assert!(!src.read_next_frame(&mut buf).unwrap());
    assert!(!src.read_next_frame(&mut buf).unwrap());

    src.reopen(&second).unwrap();
    assert!(!src.is_exhausted());
    assert!(src.read_next_frame(&mut buf).unwrap());
    assert_eq!(buf.as_slice(), &[2, 2, 2, 2]);
    assert!(src.read_next_frame(&mut buf).unwrap());
    assert!(!src.read_next_frame(&mut buf).unwrap());
    assert_eq!(buf.as_slice(), &[3, 3, 3, 3]);
}

#[test]
fn missing_file_is_not_found() {
    let err = FrameSource::open("/definitely/not/here.rgb", 12).err().unwrap();
    assert!(matches!(err, SourceError::FileNotFound(_)));
}

#[test]
fn buffer_size_must_match() {
    let mut src = FrameSource::from_reader(Cursor::new(vec![0u8; 8]), 8).unwrap();
    let mut buf = FrameBuffer::new(FrameFormat::new(2, 2, PixelLayout::Gray8));
    assert!(matches!(
        src.read_next_frame(&mut buf),
        Err(SourceError::SizeMismatch { expected: 8, actual: 4 })
    ));
}
