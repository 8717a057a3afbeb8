//! In-memory frame source, used for still images and test fixtures.

use crate::frame::{position_of, Frame};
use crate::source::{DecodedFrames, FrameSource, SourceError};
use std::path::Path;

pub struct MemorySource {
    label: String,
    frames: Vec<Frame>,
    fps: f64,
    cursor: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<Frame>, fps: f64) -> Self {
        Self {
            label: format!("memory ({} frames)", frames.len()),
            frames,
            fps,
            cursor: 0,
        }
    }

    /// Build frames from raw RGB24 buffers, assigning index and position.
    pub fn from_buffers(buffers: Vec<Vec<u8>>, width: u32, height: u32, fps: f64) -> Self {
        let frames = buffers
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let index = i as u64;
                Frame::new(data, width, height, index, position_of(index, fps))
            })
            .collect();
        Self::new(frames, fps)
    }

    /// A single still image as a one-frame source.
    pub fn from_image_path(path: &Path) -> Result<Self, SourceError> {
        let image = image::open(path)?.to_rgb8();
        let frame = Frame::from_rgb_image(image, 0, std::time::Duration::ZERO);
        let mut source = Self::new(vec![frame], 1.0);
        source.label = path.display().to_string();
        Ok(source)
    }
}

impl FrameSource for MemorySource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let frame = self.frames.get(self.cursor).cloned();
        if frame.is_some() {
            self.cursor += 1;
        }
        Ok(frame)
    }

    fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        let count = self.frames.len() as u64;
        if index > count {
            return Err(SourceError::SeekOutOfRange { index, count });
        }
        self.cursor = index as usize;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.cursor as u64
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn is_live(&self) -> bool {
        false
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn decode_all(&mut self) -> Result<DecodedFrames, SourceError> {
        Ok(DecodedFrames::in_memory(self.frames.clone(), self.fps))
    }
}
