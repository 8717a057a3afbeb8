//! patrol-core — Identity matching and patrol-zone evaluation.
//!
//! Matches probe face embeddings against a roster of registered guards,
//! evaluates on-screen positions against circular patrol zones, and wraps
//! SCRFD detection + ArcFace embedding (ONNX Runtime) behind the
//! [`FaceLocator`] contract.

pub mod alignment;
pub mod detector;
pub mod geofence;
pub mod locator;
pub mod matcher;
pub mod persistence;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use geofence::zones_containing;
pub use locator::{FaceLocator, LocatorError, OnnxFaceLocator};
pub use matcher::{MatchResult, MatchThreshold, Matcher, NearestMatcher, ThresholdError};
pub use persistence::{ArrivalSink, CollaboratorError, RosterSource, ZoneSource};
pub use types::{
    ArrivalEvent, Embedding, EmbeddingError, Identity, Point, Probe, Region, RosterRow, Zone,
    ZoneBounds,
};

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/patrol/models")
}
