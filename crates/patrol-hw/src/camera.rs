//! Live capture from a V4L2 device via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{DecodedFrames, FrameSource, SourceError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 1280;
const REQUESTED_HEIGHT: u32 = 720;
const STREAM_BUFFERS: u32 = 4;
const DEFAULT_FPS: f64 = 30.0;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed RGB24.
    Rgb3,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"RGB3" => Some(Self::Rgb3),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// A V4L2 capture device as a live, non-seekable frame source.
///
/// Frames carry the wall-clock time they were dequeued.
pub struct CameraSource {
    device: Device,
    stream: Option<MmapStream<'static>>,
    device_path: String,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    fps: f64,
    captured: u64,
}

impl CameraSource {
    /// Open a capture device by path (e.g. "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Ask for YUYV; drivers may substitute MJPG, RGB3 or GREY.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, RGB3 or GREY)",
                negotiated.fourcc
            ))
        })?;

        let fps = device
            .params()
            .ok()
            .map(|p| p.interval)
            .filter(|i| i.numerator > 0 && i.denominator > 0)
            .map(|i| i.denominator as f64 / i.numerator as f64)
            .unwrap_or(DEFAULT_FPS);

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            fps,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            fps,
            captured: 0,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn capture(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("stream not started".into()))?;

        let (buf, _meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let captured_at = chrono::Utc::now();
        let rgb = buf_to_rgb(self.pixel_format, buf, self.width, self.height)?;

        let index = self.captured;
        self.captured += 1;
        let mut frame = Frame::new(
            rgb,
            self.width,
            self.height,
            index,
            frame::position_of(index, self.fps),
        );
        frame.captured_at = Some(captured_at);
        Ok(frame)
    }
}

/// Convert one dequeued buffer to RGB24.
fn buf_to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    let failed = |e: String| CameraError::CaptureFailed(format!("{format:?} conversion failed: {e}"));
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height).map_err(|e| failed(e.to_string())),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height).map_err(|e| failed(e.to_string())),
        PixelFormat::Rgb3 => {
            let expected = Frame::rgb_len(width, height);
            if buf.len() < expected {
                return Err(failed(format!("expected {expected} bytes, got {}", buf.len())));
            }
            Ok(buf[..expected].to_vec())
        }
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map_err(|e| failed(e.to_string()))?
                .to_rgb8();
            if decoded.dimensions() != (width, height) {
                return Err(failed(format!(
                    "jpeg is {}x{}, negotiated {width}x{height}",
                    decoded.width(),
                    decoded.height()
                )));
            }
            Ok(decoded.into_raw())
        }
    }
}

impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        self.device_path.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(Some(self.capture()?))
    }

    fn seek(&mut self, _index: u64) -> Result<(), SourceError> {
        Err(SourceError::Unsupported {
            source_kind: "camera",
            operation: "seek",
        })
    }

    fn position(&self) -> u64 {
        self.captured
    }

    fn frame_count(&self) -> Option<u64> {
        None
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn is_live(&self) -> bool {
        true
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn decode_all(&mut self) -> Result<DecodedFrames, SourceError> {
        Err(SourceError::Unsupported {
            source_kind: "camera",
            operation: "decode_all",
        })
    }
}
