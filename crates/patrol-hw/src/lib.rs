//! patrol-hw — Frame sources for the patrol pipeline.
//!
//! Provides V4L2 device capture, ffmpeg-backed video file playback and
//! whole-file extraction, and in-memory / still-image sources, all behind
//! the [`FrameSource`] trait.

pub mod camera;
pub mod frame;
pub mod memory;
pub mod source;
pub mod video;

pub use camera::{CameraError, CameraSource, PixelFormat};
pub use frame::Frame;
pub use memory::MemorySource;
pub use source::{seek_relative, DecodedFrames, FrameSource, SourceError};
pub use video::{VideoFile, VideoInfo};
