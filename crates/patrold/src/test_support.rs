//! Fakes shared by the daemon's unit tests.

use crate::annotate::FrameAnnotations;
use crate::config::CooldownScope;
use crate::interactive::{ControlInput, ControlSignal, DisplaySurface};
use crate::pipeline::PatrolPipeline;
use crate::recorder::PatrolRecorder;
use crate::roster::Roster;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use patrol_core::{
    ArrivalEvent, ArrivalSink, CollaboratorError, Embedding, FaceLocator, Identity, LocatorError,
    MatchThreshold, NearestMatcher, Point, Probe, Region, Zone,
};
use patrol_hw::{DecodedFrames, Frame, FrameSource, MemorySource, SourceError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub fn identity(id: &str, values: &[f64]) -> Identity {
    Identity {
        id: id.into(),
        display_name: format!("Guard {id}"),
        embedding: Embedding::new(values.to_vec()),
        registered_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

pub fn zone(id: i64, x: f64, y: f64, radius: f64) -> Zone {
    Zone {
        id,
        camera_id: "cam1".into(),
        center: Point::new(x, y),
        radius,
        name: format!("Z{id}"),
    }
}

/// A probe whose region is centred on (`cx`, `cy`).
pub fn probe_at(cx: f64, cy: f64, values: &[f64]) -> Probe {
    Probe {
        region: Region {
            left: cx - 20.0,
            top: cy - 20.0,
            width: 40.0,
            height: 40.0,
        },
        embedding: Embedding::new(values.to_vec()),
        detection_confidence: 0.9,
    }
}

/// Pipeline over roster G1 = [1, 0, 0], G2 = [0, 1, 0] with max distance 0.5,
/// zones Z1 at (100, 100) and Z2 at (130, 100), both radius 50, and a 300 s
/// identity-scoped cooldown.
pub fn patrol_pipeline(
    locator: ScriptedLocator,
    sink: Arc<dyn ArrivalSink>,
    stride: u64,
) -> PatrolPipeline {
    let roster = Arc::new(Roster::from_identities(vec![
        identity("G1", &[1.0, 0.0, 0.0]),
        identity("G2", &[0.0, 1.0, 0.0]),
    ]));
    let recorder = PatrolRecorder::new(
        roster.clone(),
        sink,
        Duration::from_secs(300),
        CooldownScope::Identity,
    );
    let matcher = NearestMatcher::new(MatchThreshold::from_max_distance(0.5).unwrap());
    PatrolPipeline::new(
        roster,
        vec![zone(1, 100.0, 100.0, 50.0), zone(2, 130.0, 100.0, 50.0)],
        Box::new(matcher),
        Arc::new(locator),
        recorder,
        stride,
    )
}

/// Byte written into the first pixel of a frame the locator should fail on.
pub const FAIL_MARKER: u8 = 0xFF;

/// Locator keyed on the first byte of each frame.
#[derive(Default)]
pub struct ScriptedLocator {
    faces: HashMap<u8, Vec<Probe>>,
}

impl ScriptedLocator {
    pub fn with(mut self, marker: u8, probes: Vec<Probe>) -> Self {
        self.faces.insert(marker, probes);
        self
    }
}

impl FaceLocator for ScriptedLocator {
    fn locate(&self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Probe>, LocatorError> {
        match rgb.first().copied() {
            Some(FAIL_MARKER) | None => Err(LocatorError::InvalidFrame {
                width,
                height,
                expected: (width * height * 3) as usize,
                actual: rgb.len(),
            }),
            Some(marker) => Ok(self.faces.get(&marker).cloned().unwrap_or_default()),
        }
    }
}

/// 2x2 frames whose first byte is the given marker.
pub fn marked_frames(markers: &[u8], fps: f64) -> MemorySource {
    let buffers = markers
        .iter()
        .map(|&m| {
            let mut data = vec![0u8; 12];
            data[0] = m;
            data
        })
        .collect();
    MemorySource::from_buffers(buffers, 2, 2, fps)
}

#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ArrivalEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ArrivalEvent> {
        self.events.lock().clone()
    }
}

impl ArrivalSink for MemorySink {
    fn insert_arrival(&self, event: &ArrivalEvent) -> Result<(), CollaboratorError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

pub struct FailingSink;

impl ArrivalSink for FailingSink {
    fn insert_arrival(&self, _event: &ArrivalEvent) -> Result<(), CollaboratorError> {
        Err("disk full".into())
    }
}

/// Returns scripted signals immediately, then `None` forever.
#[derive(Default)]
pub struct ScriptedControl {
    script: VecDeque<Option<ControlSignal>>,
}

impl ScriptedControl {
    pub fn new(script: impl IntoIterator<Item = Option<ControlSignal>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }
}

impl ControlInput for ScriptedControl {
    fn poll(&mut self, _timeout: Duration) -> Option<ControlSignal> {
        self.script.pop_front().flatten()
    }
}

/// Keeps every frame it is shown.
#[derive(Default)]
pub struct RecordingDisplay {
    shown: Mutex<Vec<FrameAnnotations>>,
    released: Mutex<bool>,
}

impl RecordingDisplay {
    pub fn shown(&self) -> Vec<FrameAnnotations> {
        self.shown.lock().clone()
    }

    pub fn released(&self) -> bool {
        *self.released.lock()
    }
}

impl DisplaySurface for RecordingDisplay {
    fn show(&self, frame: FrameAnnotations) {
        self.shown.lock().push(frame);
    }

    fn release(&self) {
        *self.released.lock() = true;
    }
}

/// A memory source that reports itself live, like a looped file.
pub struct LoopingSource(pub MemorySource);

impl FrameSource for LoopingSource {
    fn describe(&self) -> String {
        "looping memory".into()
    }
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.0.next_frame()
    }
    fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        self.0.seek(index)
    }
    fn position(&self) -> u64 {
        self.0.position()
    }
    fn frame_count(&self) -> Option<u64> {
        self.0.frame_count()
    }
    fn fps(&self) -> f64 {
        self.0.fps()
    }
    fn is_live(&self) -> bool {
        true
    }
    fn is_seekable(&self) -> bool {
        true
    }
    fn decode_all(&mut self) -> Result<DecodedFrames, SourceError> {
        self.0.decode_all()
    }
}

/// A source whose every read fails, as a device that has gone away.
pub struct BrokenSource;

impl FrameSource for BrokenSource {
    fn describe(&self) -> String {
        "broken".into()
    }
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Err(SourceError::Decode("device unplugged".into()))
    }
    fn seek(&mut self, _index: u64) -> Result<(), SourceError> {
        Ok(())
    }
    fn position(&self) -> u64 {
        0
    }
    fn frame_count(&self) -> Option<u64> {
        None
    }
    fn fps(&self) -> f64 {
        25.0
    }
    fn is_live(&self) -> bool {
        true
    }
    fn is_seekable(&self) -> bool {
        false
    }
    fn decode_all(&mut self) -> Result<DecodedFrames, SourceError> {
        Err(SourceError::Decode("device unplugged".into()))
    }
}
