//! Live run status and the last rendered frame, shared between the pipeline
//! thread and the D-Bus service.

use crate::annotate::FrameAnnotations;
use crate::interactive::DisplaySurface;
use crate::pipeline::PipelineState;
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Interactive,
    Headless,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub version: &'static str,
    pub state: PipelineState,
    pub profile: Profile,
    pub source: String,
    pub camera_id: String,
    pub position: u64,
    pub total_frames: Option<u64>,
    pub roster_size: usize,
    pub zone_count: usize,
    pub arrivals_recorded: u64,
}

impl MonitorStatus {
    pub fn new(profile: Profile, source: &str, camera_id: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            state: PipelineState::Idle,
            profile,
            source: source.to_string(),
            camera_id: camera_id.to_string(),
            position: 0,
            total_frames: None,
            roster_size: 0,
            zone_count: 0,
            arrivals_recorded: 0,
        }
    }
}

pub struct Monitor {
    status: RwLock<MonitorStatus>,
    last_frame: RwLock<Option<FrameAnnotations>>,
}

impl Monitor {
    pub fn new(status: MonitorStatus) -> Self {
        Self {
            status: RwLock::new(status),
            last_frame: RwLock::new(None),
        }
    }

    pub fn set_state(&self, state: PipelineState) {
        self.status.write().state = state;
    }

    pub fn set_progress(&self, position: u64, total_frames: Option<u64>, arrivals_recorded: u64) {
        let mut status = self.status.write();
        status.position = position;
        status.total_frames = total_frames;
        status.arrivals_recorded = arrivals_recorded;
    }

    pub fn snapshot(&self) -> MonitorStatus {
        self.status.read().clone()
    }

    pub fn last_frame(&self) -> Option<FrameAnnotations> {
        self.last_frame.read().clone()
    }
}

impl DisplaySurface for Monitor {
    fn show(&self, frame: FrameAnnotations) {
        *self.last_frame.write() = Some(frame);
    }

    fn release(&self) {
        self.last_frame.write().take();
    }
}
