use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of one stored embedding component (IEEE-754 double).
pub const EMBEDDING_COMPONENT_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding blob is {actual} bytes, expected {expected} ({dim} x f64)")]
    InvalidLength {
        dim: usize,
        expected: usize,
        actual: usize,
    },
    #[error("embedding component {index} is not finite")]
    NonFinite { index: usize },
}

/// Face embedding vector.
///
/// Stored and transmitted as a fixed-length array of little-endian f64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decode a stored embedding blob. The blob must hold exactly `dim` doubles.
    pub fn from_le_bytes(bytes: &[u8], dim: usize) -> Result<Self, EmbeddingError> {
        let expected = dim * EMBEDDING_COMPONENT_BYTES;
        if bytes.len() != expected {
            return Err(EmbeddingError::InvalidLength {
                dim,
                expected,
                actual: bytes.len(),
            });
        }

        let mut values = Vec::with_capacity(dim);
        for (index, chunk) in bytes.chunks_exact(EMBEDDING_COMPONENT_BYTES).enumerate() {
            let mut raw = [0u8; EMBEDDING_COMPONENT_BYTES];
            raw.copy_from_slice(chunk);
            let v = f64::from_le_bytes(raw);
            if !v.is_finite() {
                return Err(EmbeddingError::NonFinite { index });
            }
            values.push(v);
        }

        Ok(Self { values })
    }

    /// Encode as the stored blob layout.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Euclidean distance to another embedding.
    ///
    /// Returns `None` when the lengths differ: distances between vectors of
    /// different models are meaningless.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f64> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

/// A registered guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub registered_at: DateTime<Utc>,
}

/// Raw roster row as returned by the roster source, before decoding.
#[derive(Debug, Clone)]
pub struct RosterRow {
    pub id: String,
    pub name: String,
    pub embedding_bytes: Vec<u8>,
    pub registered_at: DateTime<Utc>,
}

/// Point in camera pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Circular patrol zone ("patrol point") in one camera's pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: i64,
    pub camera_id: String,
    pub center: Point,
    pub radius: f64,
    pub name: String,
}

impl Zone {
    /// Inclusive containment: a point exactly `radius` away is inside.
    pub fn contains(&self, point: &Point) -> bool {
        self.center.distance_to(point) <= self.radius
    }
}

/// Allowed radius band for zones, with the default used when none is given.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneBounds {
    pub default_radius: f64,
    pub min_radius: f64,
    pub max_radius: f64,
}

impl Default for ZoneBounds {
    fn default() -> Self {
        Self {
            default_radius: 100.0,
            min_radius: 20.0,
            max_radius: 400.0,
        }
    }
}

impl ZoneBounds {
    /// Apply the default to a missing radius and clamp into `[min, max]`.
    pub fn normalize(&self, radius: Option<f64>) -> f64 {
        radius
            .unwrap_or(self.default_radius)
            .clamp(self.min_radius, self.max_radius)
    }

    pub fn contains(&self, radius: f64) -> bool {
        radius >= self.min_radius && radius <= self.max_radius
    }
}

/// Bounding region of a detected face, in original frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    /// Midpoint of the region; used as the guard's on-screen position.
    pub fn centroid(&self) -> Point {
        Point::new(self.left + self.width / 2.0, self.top + self.height / 2.0)
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn region(&self) -> Region {
        Region {
            left: self.x as f64,
            top: self.y as f64,
            width: self.width as f64,
            height: self.height as f64,
        }
    }
}

/// A face found in one frame. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct Probe {
    pub region: Region,
    pub embedding: Embedding,
    pub detection_confidence: f32,
}

/// A recorded arrival of a guard at a patrol zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrivalEvent {
    pub identity_id: String,
    pub zone_id: i64,
    pub timestamp: DateTime<Utc>,
}
