//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes a packed RGB24 frame to the 640×640 network input, decodes the three
//! anchor-free stride heads, and maps boxes and landmarks back to frame
//! pixel coordinates before NMS.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> (Self, usize, usize) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, target);
        let letterbox = Self {
            scale,
            pad_x: (target - new_w) as f32 / 2.0,
            pad_y: (target - new_h) as f32 / 2.0,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from network-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output tensor indices for one stride.
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self { session, stride_outputs })
    }

    /// Detect faces in a packed RGB24 frame, highest confidence first.
    pub fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 || rgb.len() < width * height * CHANNELS {
            return Err(DetectorError::InferenceFailed(format!(
                "frame buffer holds {} bytes, need {width}x{height} RGB",
                rgb.len()
            )));
        }

        let (letterbox, new_w, new_h) = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let resized = resize_bilinear(rgb, width, height, new_w, new_h);
        let input = to_input_tensor(&resized, new_w, new_h, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize a packed RGB24 image with bilinear interpolation.
fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let sx = width as f32 / new_w as f32;
    let sy = height as f32 / new_h as f32;
    let mut out = vec![0u8; new_w * new_h * CHANNELS];
    let at = |x: usize, y: usize, c: usize| src[(y * width + x) * CHANNELS + c] as f32;

    for y in 0..new_h {
        let fy_src = (y as f32 + 0.5) * sy - 0.5;
        let y0 = (fy_src.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (fy_src - fy_src.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let fx_src = (x as f32 + 0.5) * sx - 0.5;
            let x0 = (fx_src.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (fx_src - fx_src.floor()).clamp(0.0, 1.0);

            for c in 0..CHANNELS {
                let top = at(x0, y0, c) * (1.0 - fx) + at(x1, y0, c) * fx;
                let bottom = at(x0, y1, c) * (1.0 - fx) + at(x1, y1, c) * fx;
                out[(y * new_w + x) * CHANNELS + c] =
                    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Place the resized RGB image on a padded canvas and normalize to NCHW.
///
/// Padding uses the mean value so it normalizes to 0.0. Channels keep RGB
/// order, which is what the InsightFace exports expect.
fn to_input_tensor(resized: &[u8], new_w: usize, new_h: usize, letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let x_start = letterbox.pad_x.floor() as usize;
    let y_start = letterbox.pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, CHANNELS, size, size));

    for y in y_start..(y_start + new_h).min(size) {
        for x in x_start..(x_start + new_w).min(size) {
            let base = ((y - y_start) * new_w + (x - x_start)) * CHANNELS;
            for c in 0..CHANNELS {
                let pixel = resized[base + c] as f32;
                tensor[[0, c, y, x]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    tensor
}

/// Map output tensors to stride slots.
///
/// Uses names like "score_8" / "bbox_16" / "kps_32" when the export provides
/// them, otherwise the standard positional layout
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => return [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
        }
    }
    named
}

/// Decode candidate detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - offsets[0] * s, ay - offsets[1] * s);
        let (x2, y2) = letterbox.unmap(ax + offsets[2] * s, ay + offsets[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    out
}

/// Non-maximum suppression. Output is sorted by confidence, descending.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
