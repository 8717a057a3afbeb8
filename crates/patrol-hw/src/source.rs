//! The frame source abstraction shared by cameras, files and fixtures.

use crate::camera::CameraError;
use crate::frame::{position_of, Frame};
use crate::memory::MemorySource;
use crate::video::VideoFile;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("failed to open source: {0}")]
    Open(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("seek to frame {index} out of range ({count} frames)")]
    SeekOutOfRange { index: u64, count: u64 },
    #[error("operation not supported by {source_kind}: {operation}")]
    Unsupported {
        source_kind: &'static str,
        operation: &'static str,
    },
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// An ordered stream of frames.
///
/// `next_frame` returns `Ok(None)` at end of stream. Live sources never end.
pub trait FrameSource: Send {
    /// Human-readable label for logs.
    fn describe(&self) -> String;

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Reposition so the next frame read is `index`.
    fn seek(&mut self, index: u64) -> Result<(), SourceError>;

    /// Index of the frame the next `next_frame` call will return.
    fn position(&self) -> u64;

    /// Total frame count, when known.
    fn frame_count(&self) -> Option<u64>;

    fn fps(&self) -> f64;

    /// True for capture devices and looping playback.
    fn is_live(&self) -> bool;

    fn is_seekable(&self) -> bool;

    /// Decode every frame up front for batch processing.
    fn decode_all(&mut self) -> Result<DecodedFrames, SourceError>;
}

/// Seek by a signed number of frames, clamped to `[0, frame_count - 1]`.
///
/// Returns the index landed on. Sources without a known length clamp only
/// at zero.
pub fn seek_relative(source: &mut dyn FrameSource, delta: i64) -> Result<u64, SourceError> {
    let target = clamp_seek(source.position(), delta, source.frame_count());
    source.seek(target)?;
    Ok(target)
}

fn clamp_seek(current: u64, delta: i64, count: Option<u64>) -> u64 {
    let target = if delta < 0 {
        current.saturating_sub(delta.unsigned_abs())
    } else {
        current.saturating_add(delta as u64)
    };
    match count {
        Some(0) => 0,
        Some(n) => target.min(n - 1),
        None => target,
    }
}

enum FrameSlot {
    Memory(Frame),
    Stored(PathBuf),
}

/// A fully decoded source, addressable by frame index.
///
/// Frames extracted to disk live in a temporary directory owned by this
/// value and removed when it drops.
pub struct DecodedFrames {
    slots: Vec<FrameSlot>,
    fps: f64,
    _storage: Option<tempfile::TempDir>,
}

impl DecodedFrames {
    pub fn in_memory(frames: Vec<Frame>, fps: f64) -> Self {
        Self {
            slots: frames.into_iter().map(FrameSlot::Memory).collect(),
            fps,
            _storage: None,
        }
    }

    /// Frames stored as image files, in index order.
    pub fn stored(storage: tempfile::TempDir, paths: Vec<PathBuf>, fps: f64) -> Self {
        Self {
            slots: paths.into_iter().map(FrameSlot::Stored).collect(),
            fps,
            _storage: Some(storage),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Load frame `index`.
    pub fn load(&self, index: usize) -> Result<Frame, SourceError> {
        match self.slots.get(index) {
            Some(FrameSlot::Memory(frame)) => Ok(frame.clone()),
            Some(FrameSlot::Stored(path)) => {
                let image = image::open(path)?.to_rgb8();
                Ok(Frame::from_rgb_image(
                    image,
                    index as u64,
                    position_of(index as u64, self.fps),
                ))
            }
            None => Err(SourceError::SeekOutOfRange {
                index: index as u64,
                count: self.slots.len() as u64,
            }),
        }
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp", "tif", "tiff"];

/// Open a source by path: `/dev/video*` as a capture device, still images as
/// a single-frame source, anything else as a video file.
pub fn open_source(path: &Path, looping: bool) -> Result<Box<dyn FrameSource>, SourceError> {
    let text = path.to_string_lossy();
    if text.starts_with("/dev/video") {
        return Ok(Box::new(crate::camera::CameraSource::open(&text)?));
    }
    if !path.exists() {
        return Err(SourceError::NotFound(text.into_owned()));
    }

    let is_image = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if is_image {
        return Ok(Box::new(MemorySource::from_image_path(path)?));
    }

    Ok(Box::new(VideoFile::open(path, looping)?))
}
