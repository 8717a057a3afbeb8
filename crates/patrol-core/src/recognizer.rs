//! ArcFace embedding extraction via ONNX Runtime.
//!
//! Aligns each detected face to the canonical 112×112 crop and runs the
//! w600k_r50 model, producing an L2-normalized 512-dimensional embedding.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

/// Embedding length produced by the bundled ArcFace model.
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedding extractor.
pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract the embedding of one detected face from a packed RGB24 frame.
    pub fn embed(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Vec<f32>, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(rgb, width, height, landmarks);
        let input = to_input_tensor(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw))
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// Aligned RGB24 crop → NCHW tensor, channels in RGB order.
fn to_input_tensor(aligned: &[u8]) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, ALIGNED_SIZE, ALIGNED_SIZE));
    for y in 0..ALIGNED_SIZE {
        for x in 0..ALIGNED_SIZE {
            let base = (y * ALIGNED_SIZE + x) * 3;
            for c in 0..3 {
                let pixel = aligned.get(base + c).copied().unwrap_or(0) as f32;
                tensor[[0, c, y, x]] = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
    }
    tensor
}
