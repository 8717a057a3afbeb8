//! Frame type and pixel-format conversion to packed RGB24.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A decoded frame in packed RGB24, row-major.
#[derive(Clone, Debug)]
pub struct Frame {
    /// width * height * 3 bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Zero-based index within the source.
    pub index: u64,
    /// Offset of this frame from the start of the source.
    pub position: Duration,
    /// Wall-clock capture time; set by live devices only.
    pub captured_at: Option<DateTime<Utc>>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64, position: Duration) -> Self {
        Self {
            data,
            width,
            height,
            index,
            position,
            captured_at: None,
        }
    }

    pub fn from_rgb_image(image: image::RgbImage, index: u64, position: Duration) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, index, position)
    }

    /// Byte length of an RGB24 frame of the given size.
    pub fn rgb_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

/// Offset of frame `index` at `fps` frames per second, rounded to the
/// nearest nanosecond.
pub fn position_of(index: u64, fps: f64) -> Duration {
    if fps > 0.0 {
        Duration::from_nanos((index as f64 * 1e9 / fps).round() as u64)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convert packed YUYV 4:2:2 to RGB24 (BT.601, full range).
///
/// Every 4 bytes [Y0, U, Y1, V] carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

/// Replicate an 8-bit grey plane into RGB24.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    Ok(grey[..expected].iter().flat_map(|&g| [g, g, g]).collect())
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
