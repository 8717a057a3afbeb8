//! Annotation data for the display surface.
//!
//! The daemon does not draw; it produces what should be drawn. Matched faces
//! get a green box and a `name (id)` label, unmatched faces a bare red box,
//! and every zone of the camera its circle and name.

use crate::pipeline::FrameReport;
use chrono::{DateTime, Utc};
use patrol_core::{MatchResult, Point, Region, Zone};
use serde::Serialize;

pub const MATCHED_COLOR: [u8; 3] = [0, 255, 0];
pub const UNMATCHED_COLOR: [u8; 3] = [255, 0, 0];
pub const ZONE_COLOR: [u8; 3] = [255, 255, 0];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceBox {
    pub region: Region,
    pub label: Option<String>,
    pub color: [u8; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneCircle {
    pub zone_id: i64,
    pub name: String,
    pub center: Point,
    pub radius: f64,
    pub color: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    /// One-based index of the frame on screen.
    pub position: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn label(&self) -> String {
        match self.total {
            Some(total) => format!("{}/{}", self.position, total),
            None => format!("{}", self.position),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameAnnotations {
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    pub faces: Vec<FaceBox>,
    pub zones: Vec<ZoneCircle>,
    pub progress: Progress,
}

pub fn annotate(
    report: &FrameReport,
    width: u32,
    height: u32,
    zones: &[Zone],
    total: Option<u64>,
) -> FrameAnnotations {
    let faces = report
        .faces
        .iter()
        .map(|face| match &face.result {
            MatchResult::Matched {
                identity_id,
                display_name,
                ..
            } => FaceBox {
                region: face.region,
                label: Some(format!("{display_name} ({identity_id})")),
                color: MATCHED_COLOR,
            },
            MatchResult::NoMatch => FaceBox {
                region: face.region,
                label: None,
                color: UNMATCHED_COLOR,
            },
        })
        .collect();

    let zones = zones
        .iter()
        .map(|z| ZoneCircle {
            zone_id: z.id,
            name: z.name.clone(),
            center: z.center,
            radius: z.radius,
            color: ZONE_COLOR,
        })
        .collect();

    FrameAnnotations {
        frame_index: report.frame_index,
        width,
        height,
        timestamp: report.timestamp,
        faces,
        zones,
        progress: Progress {
            position: report.frame_index + 1,
            total,
        },
    }
}
