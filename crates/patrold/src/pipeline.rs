//! The patrol pipeline: detect, match, geofence, record.
//!
//! [`PatrolPipeline::process_frame`] is the per-frame unit of work shared by
//! both frame consumers. It is `Sync`: the batch consumer calls it from many
//! workers at once.

use crate::recorder::{PatrolRecorder, RecordOutcome};
use crate::roster::Roster;
use crate::status::Monitor;
use chrono::{DateTime, Utc};
use patrol_core::{zones_containing, FaceLocator, MatchResult, Matcher, Region, Zone, ZoneBounds};
use patrol_hw::{Frame, FrameSource, SourceError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source: {0}")]
    Source(#[from] SourceError),
    #[error("zones for camera {camera}: {message}")]
    Zones { camera: String, message: String },
    #[error("illegal state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("worker pool: {0}")]
    Pool(String),
    #[error("pipeline thread: {0}")]
    Thread(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl PipelineState {
    fn can_enter(self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Idle, Stopped)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
        )
    }
}

/// Tracks the pipeline state and publishes every change to the monitor.
pub struct StateMachine {
    state: PipelineState,
    monitor: Arc<Monitor>,
}

impl StateMachine {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        monitor.set_state(PipelineState::Idle);
        Self {
            state: PipelineState::Idle,
            monitor,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn advance(&mut self, to: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_enter(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = ?self.state, to = ?to, "pipeline state");
        self.state = to;
        self.monitor.set_state(to);
        Ok(())
    }
}

/// Maps frames to event timestamps.
///
/// File frames are stamped `origin + loop offset + position`, so the stamp
/// depends only on where the frame sits in the source and both consumers
/// produce the same stamps. Live capture frames carry their own wall-clock
/// time.
#[derive(Debug, Clone, Copy)]
pub struct SourceClock {
    origin: DateTime<Utc>,
    loop_offset: Duration,
}

impl SourceClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            loop_offset: Duration::ZERO,
        }
    }

    pub fn timestamp(&self, frame: &Frame) -> DateTime<Utc> {
        if let Some(at) = frame.captured_at {
            return at;
        }
        let offset = self.loop_offset + frame.position;
        self.origin + chrono::Duration::microseconds(offset.as_micros() as i64)
    }

    /// Account for one full pass of a looping source of length `pass`.
    pub fn wrap(&mut self, pass: Duration) {
        self.loop_offset += pass;
    }
}

/// One matched or unmatched face and what happened to it.
#[derive(Debug, Clone)]
pub struct FaceReport {
    pub region: Region,
    pub result: MatchResult,
    /// Zones containing the face centroid (matched faces only).
    pub zones: Vec<i64>,
    pub outcomes: Vec<RecordOutcome>,
}

#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame_index: u64,
    pub timestamp: DateTime<Utc>,
    pub faces: Vec<FaceReport>,
    pub detection_failed: bool,
}

impl FrameReport {
    /// A frame that was read but not analysed.
    pub fn skipped(frame_index: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            frame_index,
            timestamp,
            faces: Vec::new(),
            detection_failed: false,
        }
    }

    pub fn recorded(&self) -> u64 {
        self.faces
            .iter()
            .flat_map(|f| &f.outcomes)
            .filter(|o| o.is_recorded())
            .count() as u64
    }
}

/// Totals for one run of a frame consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub arrivals: u64,
    /// A stop request ended the run before the source was exhausted.
    pub interrupted: bool,
}

/// Clamp every zone radius into `bounds`.
///
/// Rows can predate a narrowed band or come from another writer; each
/// adjusted zone is logged.
pub fn enforce_zone_bounds(zones: Vec<Zone>, bounds: &ZoneBounds) -> Vec<Zone> {
    zones
        .into_iter()
        .map(|mut zone| {
            if !bounds.contains(zone.radius) {
                let clamped = bounds.normalize(Some(zone.radius));
                tracing::warn!(
                    zone = zone.id,
                    name = %zone.name,
                    radius = zone.radius,
                    clamped,
                    min = bounds.min_radius,
                    max = bounds.max_radius,
                    "zone radius outside the configured band"
                );
                zone.radius = clamped;
            }
            zone
        })
        .collect()
}

pub struct PatrolPipeline {
    roster: Arc<Roster>,
    zones: Vec<Zone>,
    matcher: Box<dyn Matcher>,
    locator: Arc<dyn FaceLocator>,
    recorder: PatrolRecorder,
    frame_stride: u64,
}

impl PatrolPipeline {
    pub fn new(
        roster: Arc<Roster>,
        zones: Vec<Zone>,
        matcher: Box<dyn Matcher>,
        locator: Arc<dyn FaceLocator>,
        recorder: PatrolRecorder,
        frame_stride: u64,
    ) -> Self {
        Self {
            roster,
            zones,
            matcher,
            locator,
            recorder,
            frame_stride: frame_stride.max(1),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn recorder(&self) -> &PatrolRecorder {
        &self.recorder
    }

    /// Whether frame `index` falls on the sampling stride.
    pub fn should_process(&self, index: u64) -> bool {
        index % self.frame_stride == 0
    }

    /// Run the full detect, match, geofence, record sequence on one frame.
    ///
    /// Detection failures are logged and treated as an empty frame.
    pub fn process_frame(&self, frame: &Frame, timestamp: DateTime<Utc>) -> FrameReport {
        let probes = match self.locator.locate(&frame.data, frame.width, frame.height) {
            Ok(probes) => probes,
            Err(e) => {
                tracing::warn!(frame = frame.index, error = %e, "detection failed");
                return FrameReport {
                    detection_failed: true,
                    ..FrameReport::skipped(frame.index, timestamp)
                };
            }
        };

        let mut faces = Vec::with_capacity(probes.len());
        for probe in probes {
            let result = self.matcher.compare(&probe.embedding, self.roster.all());
            let mut report = FaceReport {
                region: probe.region,
                result,
                zones: Vec::new(),
                outcomes: Vec::new(),
            };

            if let MatchResult::Matched {
                identity_id,
                display_name,
                confidence,
                ..
            } = &report.result
            {
                let centroid = probe.region.centroid();
                tracing::debug!(
                    frame = frame.index,
                    identity = %identity_id,
                    name = %display_name,
                    confidence,
                    x = centroid.x,
                    y = centroid.y,
                    "guard identified"
                );
                for zone in zones_containing(&centroid, &self.zones) {
                    report.zones.push(zone.id);
                    report
                        .outcomes
                        .push(self.recorder.record(identity_id, zone, timestamp));
                }
            } else {
                tracing::trace!(frame = frame.index, "unmatched face");
            }
            faces.push(report);
        }

        FrameReport {
            frame_index: frame.index,
            timestamp,
            faces,
            detection_failed: false,
        }
    }
}

/// Drives a frame source through the pipeline until it stops.
///
/// Chosen once per run: the interactive consumer renders and takes control
/// input, the batch consumer fans frames out over a worker pool.
pub trait FrameConsumer: Send {
    fn run(
        &mut self,
        pipeline: &PatrolPipeline,
        source: &mut dyn FrameSource,
        clock: SourceClock,
    ) -> Result<RunSummary, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::SuppressReason;
    use crate::status::{MonitorStatus, Profile};
    use crate::test_support::*;
    use chrono::TimeZone;

    fn frame(marker: u8, index: u64) -> Frame {
        let mut data = vec![0u8; 12];
        data[0] = marker;
        Frame::new(data, 2, 2, index, Duration::from_millis(index * 40))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_zone_radius_clamped_into_band() {
        let zone = |id: i64, radius: f64| Zone {
            id,
            camera_id: "cam1".into(),
            center: patrol_core::Point::new(0.0, 0.0),
            radius,
            name: format!("z{id}"),
        };
        let bounds = ZoneBounds {
            default_radius: 50.0,
            min_radius: 30.0,
            max_radius: 120.0,
        };
        let zones = enforce_zone_bounds(vec![zone(1, 10.0), zone(2, 80.0), zone(3, 500.0)], &bounds);
        let radii: Vec<f64> = zones.iter().map(|z| z.radius).collect();
        assert_eq!(radii, vec![30.0, 80.0, 120.0]);
        assert_eq!(zones.iter().map(|z| z.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_state_transitions() {
        let monitor = Arc::new(Monitor::new(MonitorStatus::new(Profile::Headless, "test", "cam1")));
        let mut sm = StateMachine::new(monitor.clone());
        assert!(sm.advance(PipelineState::Paused).is_err(), "idle cannot pause");
        sm.advance(PipelineState::Running).unwrap();
        sm.advance(PipelineState::Paused).unwrap();
        sm.advance(PipelineState::Running).unwrap();
        sm.advance(PipelineState::Stopped).unwrap();
        assert_eq!(monitor.snapshot().state, PipelineState::Stopped);
        assert!(sm.advance(PipelineState::Running).is_err(), "stopped is terminal");
    }

    #[test]
    fn test_clock_uses_position_and_loop_offset() {
        let mut clock = SourceClock::new(t0());
        let f = frame(0, 25);
        assert_eq!(clock.timestamp(&f), t0() + chrono::Duration::seconds(1));
        clock.wrap(Duration::from_secs(10));
        assert_eq!(clock.timestamp(&f), t0() + chrono::Duration::seconds(11));
    }

    #[test]
    fn test_clock_prefers_capture_time() {
        let clock = SourceClock::new(t0());
        let mut f = frame(0, 25);
        let captured = t0() + chrono::Duration::hours(1);
        f.captured_at = Some(captured);
        assert_eq!(clock.timestamp(&f), captured);
    }

    #[test]
    fn test_match_in_overlapping_zones_records_once_per_identity() {
        let sink = Arc::new(MemorySink::default());
        let locator = ScriptedLocator::default().with(1, vec![probe_at(115.0, 100.0, &[1.0, 0.1, 0.0])]);
        let p = patrol_pipeline(locator, sink.clone(), 1);

        let report = p.process_frame(&frame(1, 0), t0());
        let face = &report.faces[0];
        assert_eq!(face.result.identity_id(), Some("G1"));
        assert_eq!(face.zones, vec![1, 2]);
        assert!(face.outcomes[0].is_recorded());
        assert_eq!(
            face.outcomes[1],
            RecordOutcome::Suppressed(SuppressReason::Cooldown { last_recorded_at: t0() }),
            "identity-scoped cooldown covers the second zone"
        );
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_unmatched_face_not_recorded() {
        let sink = Arc::new(MemorySink::default());
        let locator = ScriptedLocator::default().with(1, vec![probe_at(100.0, 100.0, &[0.0, 0.0, 1.0])]);
        let p = patrol_pipeline(locator, sink.clone(), 1);

        let report = p.process_frame(&frame(1, 0), t0());
        assert_eq!(report.faces[0].result, MatchResult::NoMatch);
        assert!(report.faces[0].zones.is_empty());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_match_outside_zones_not_recorded() {
        let sink = Arc::new(MemorySink::default());
        let locator = ScriptedLocator::default().with(1, vec![probe_at(400.0, 400.0, &[1.0, 0.0, 0.0])]);
        let p = patrol_pipeline(locator, sink.clone(), 1);

        let report = p.process_frame(&frame(1, 0), t0());
        assert!(report.faces[0].result.is_match());
        assert_eq!(report.recorded(), 0);
    }

    #[test]
    fn test_detection_failure_is_empty_frame() {
        let sink = Arc::new(MemorySink::default());
        let p = patrol_pipeline(ScriptedLocator::default(), sink, 1);
        let report = p.process_frame(&frame(FAIL_MARKER, 3), t0());
        assert!(report.detection_failed);
        assert!(report.faces.is_empty());
        assert_eq!(report.frame_index, 3);
    }

    #[test]
    fn test_frame_stride() {
        let p = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 3);
        let sampled: Vec<u64> = (0..7).filter(|&i| p.should_process(i)).collect();
        assert_eq!(sampled, vec![0, 3, 6]);
    }
}
