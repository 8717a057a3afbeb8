//! Face location: frame in, (region, embedding) probes out.

use crate::detector::{DetectorError, ScrfdDetector};
use crate::recognizer::{ArcFaceRecognizer, RecognizerError};
use crate::types::{Embedding, Probe};
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

/// Bytes per pixel of the frame layout the pipeline hands to a locator (RGB24).
pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("model produced {actual}-dim embeddings, roster expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Finds faces in a frame and computes their embeddings.
///
/// Input frames are packed RGB24, row-major. Regions are reported in the
/// frame's own pixel coordinates. No faces is `Ok(vec![])`, not an error.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Probe>, LocatorError>;
}

struct Models {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
}

/// SCRFD + ArcFace locator.
///
/// ONNX sessions are not shared across concurrent `run` calls here: both
/// models sit behind one lock, so concurrent callers are serialized.
pub struct OnnxFaceLocator {
    models: Mutex<Models>,
    min_face_size: f32,
    embedding_dim: usize,
}

impl OnnxFaceLocator {
    pub fn load(
        scrfd_path: &Path,
        arcface_path: &Path,
        min_face_size: u32,
        embedding_dim: usize,
    ) -> Result<Self, LocatorError> {
        if embedding_dim != crate::recognizer::ARCFACE_EMBEDDING_DIM {
            return Err(LocatorError::DimensionMismatch {
                expected: embedding_dim,
                actual: crate::recognizer::ARCFACE_EMBEDDING_DIM,
            });
        }

        let detector = ScrfdDetector::load(scrfd_path)?;
        let recognizer = ArcFaceRecognizer::load(arcface_path)?;

        Ok(Self {
            models: Mutex::new(Models { detector, recognizer }),
            min_face_size: min_face_size as f32,
            embedding_dim,
        })
    }
}

impl FaceLocator for OnnxFaceLocator {
    fn locate(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Probe>, LocatorError> {
        let expected = width as usize * height as usize * RGB_CHANNELS;
        if rgb.len() != expected || expected == 0 {
            return Err(LocatorError::InvalidFrame {
                width,
                height,
                expected,
                actual: rgb.len(),
            });
        }

        let mut models = self.models.lock();
        let faces = models.detector.detect(rgb, width, height)?;

        let mut probes = Vec::with_capacity(faces.len());
        for face in faces {
            if face.width < self.min_face_size || face.height < self.min_face_size {
                tracing::trace!(width = face.width, height = face.height, "face below minimum size");
                continue;
            }
            let raw = models.recognizer.embed(rgb, width, height, &face)?;
            if raw.len() != self.embedding_dim {
                return Err(LocatorError::DimensionMismatch {
                    expected: self.embedding_dim,
                    actual: raw.len(),
                });
            }
            probes.push(Probe {
                region: face.region(),
                embedding: Embedding::new(raw.into_iter().map(f64::from).collect()),
                detection_confidence: face.confidence,
            });
        }

        Ok(probes)
    }
}
