//! Interactive frame consumer.
//!
//! Single-threaded: read one frame, process it, hand the annotations to the
//! display surface, then wait up to one frame interval for a control signal.
//! The wait doubles as playback pacing.

use crate::annotate::{annotate, FrameAnnotations};
use crate::pipeline::{
    FrameConsumer, FrameReport, PatrolPipeline, PipelineError, PipelineState, RunSummary,
    SourceClock, StateMachine,
};
use crate::status::Monitor;
use patrol_hw::frame::position_of;
use patrol_hw::{seek_relative, FrameSource, SourceError};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive read failures tolerated before the run is abandoned.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Quit,
    PauseToggle,
    SeekBack,
    SeekForward,
}

pub trait ControlInput: Send {
    /// Wait up to `timeout` for the next signal.
    fn poll(&mut self, timeout: Duration) -> Option<ControlSignal>;
}

impl ControlInput for Receiver<ControlSignal> {
    fn poll(&mut self, timeout: Duration) -> Option<ControlSignal> {
        match self.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Nobody can send any more; keep pacing playback.
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

/// Where annotated frames go.
pub trait DisplaySurface: Send + Sync {
    fn show(&self, frame: FrameAnnotations);
    /// Drop whatever is on screen.
    fn release(&self);
}

struct ReleaseOnDrop(Arc<dyn DisplaySurface>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub struct InteractiveConsumer<C: ControlInput> {
    control: C,
    display: Arc<dyn DisplaySurface>,
    monitor: Arc<Monitor>,
    seek_step: Duration,
}

impl<C: ControlInput> InteractiveConsumer<C> {
    pub fn new(
        control: C,
        display: Arc<dyn DisplaySurface>,
        monitor: Arc<Monitor>,
        seek_step: Duration,
    ) -> Self {
        Self {
            control,
            display,
            monitor,
            seek_step,
        }
    }
}

fn frame_interval(fps: f64) -> Duration {
    if fps.is_finite() && fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::from_millis(33)
    }
}

impl<C: ControlInput> FrameConsumer for InteractiveConsumer<C> {
    fn run(
        &mut self,
        pipeline: &PatrolPipeline,
        source: &mut dyn FrameSource,
        mut clock: SourceClock,
    ) -> Result<RunSummary, PipelineError> {
        let _release = ReleaseOnDrop(self.display.clone());
        let mut state = StateMachine::new(self.monitor.clone());
        state.advance(PipelineState::Running)?;

        let fps = source.fps();
        let interval = frame_interval(fps);
        let seek_frames = ((self.seek_step.as_secs_f64() * fps).round() as i64).max(1);
        let total = source.frame_count();
        let mut summary = RunSummary::default();
        let mut read_errors = 0u32;
        let mut read_since_rewind = false;

        tracing::info!(source = %source.describe(), fps, frames = ?total, "interactive run started");

        let outcome = loop {
            if state.state() == PipelineState::Running {
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        read_errors = 0;
                        read_since_rewind = true;
                        summary.frames_read += 1;
                        let timestamp = clock.timestamp(&frame);
                        let report = if pipeline.should_process(frame.index) {
                            summary.frames_processed += 1;
                            pipeline.process_frame(&frame, timestamp)
                        } else {
                            FrameReport::skipped(frame.index, timestamp)
                        };
                        summary.arrivals += report.recorded();

                        self.display.show(annotate(
                            &report,
                            frame.width,
                            frame.height,
                            pipeline.zones(),
                            total,
                        ));
                        self.monitor.set_progress(
                            frame.index + 1,
                            total,
                            pipeline.recorder().recorded_count(),
                        );
                    }
                    Ok(None) if source.is_live() && source.is_seekable() => {
                        if !read_since_rewind {
                            tracing::error!("looping source yields no frames, stopping");
                            break Err(PipelineError::Source(SourceError::Decode(
                                "looping source produced no frames".into(),
                            )));
                        }
                        clock.wrap(position_of(source.position(), fps));
                        source.seek(0)?;
                        read_since_rewind = false;
                        tracing::debug!("end of looping source, rewinding");
                    }
                    Ok(None) => {
                        tracing::info!("end of source");
                        break Ok(());
                    }
                    Err(e) => {
                        read_errors += 1;
                        tracing::warn!(error = %e, consecutive = read_errors, "frame read failed");
                        if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            tracing::error!("too many consecutive read failures, stopping");
                            break Err(PipelineError::Source(e));
                        }
                    }
                }
            }

            match self.control.poll(interval) {
                Some(ControlSignal::Quit) => {
                    tracing::info!("quit requested");
                    summary.interrupted = true;
                    break Ok(());
                }
                Some(ControlSignal::PauseToggle) => {
                    let next = match state.state() {
                        PipelineState::Paused => PipelineState::Running,
                        _ => PipelineState::Paused,
                    };
                    state.advance(next)?;
                    tracing::info!(state = ?next, "playback toggled");
                }
                Some(signal @ (ControlSignal::SeekBack | ControlSignal::SeekForward)) => {
                    if !source.is_seekable() {
                        tracing::debug!("source is not seekable, ignoring seek");
                        continue;
                    }
                    let delta = if signal == ControlSignal::SeekBack {
                        -seek_frames
                    } else {
                        seek_frames
                    };
                    match seek_relative(source, delta) {
                        Ok(at) => tracing::debug!(delta, at, "seeked"),
                        Err(e) => tracing::warn!(error = %e, "seek failed"),
                    }
                }
                None => {}
            }
        };

        state.advance(PipelineState::Stopped)?;
        outcome?;
        tracing::info!(
            frames = summary.frames_read,
            processed = summary.frames_processed,
            arrivals = summary.arrivals,
            "interactive run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MonitorStatus, Profile};
    use crate::test_support::*;
    use chrono::{TimeZone, Utc};
    use patrol_core::ArrivalEvent;

    fn consumer(
        script: Vec<Option<ControlSignal>>,
        display: Arc<RecordingDisplay>,
    ) -> (InteractiveConsumer<ScriptedControl>, Arc<Monitor>) {
        let monitor = Arc::new(Monitor::new(MonitorStatus::new(Profile::Interactive, "mem", "cam1")));
        let c = InteractiveConsumer::new(
            ScriptedControl::new(script),
            display,
            monitor.clone(),
            Duration::from_secs(5),
        );
        (c, monitor)
    }

    fn origin() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    /// Frames 10 and 11 show G1 at the centre of Z1.
    fn scenario() -> (ScriptedLocator, Vec<u8>) {
        let locator = ScriptedLocator::default().with(1, vec![probe_at(100.0, 100.0, &[0.98, 0.05, 0.0])]);
        let mut markers = vec![0u8; 20];
        markers[10] = 1;
        markers[11] = 1;
        (locator, markers)
    }

    #[test]
    fn test_end_to_end_single_arrival() {
        let (locator, markers) = scenario();
        let sink = Arc::new(MemorySink::default());
        let pipeline = patrol_pipeline(locator, sink.clone(), 1);
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, monitor) = consumer(vec![], display.clone());
        let mut source = marked_frames(&markers, 25.0);

        let summary = c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();

        assert_eq!(
            sink.events(),
            vec![ArrivalEvent {
                identity_id: "G1".into(),
                zone_id: 1,
                timestamp: origin() + chrono::Duration::milliseconds(400),
            }]
        );
        assert_eq!(summary.frames_read, 20);
        assert_eq!(summary.arrivals, 1);
        assert!(!summary.interrupted);
        assert_eq!(monitor.snapshot().state, PipelineState::Stopped);
        assert!(display.released(), "display released on exit");
        let shown = display.shown();
        assert_eq!(shown[10].faces[0].label.as_deref(), Some("Guard G1 (G1)"));
        assert_eq!(shown[19].progress.label(), "20/20");
    }

    #[test]
    fn test_quit_stops_run() {
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, _) = consumer(vec![None, Some(ControlSignal::Quit)], display.clone());
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = marked_frames(&[0; 10], 25.0);

        let summary = c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert_eq!(summary.frames_read, 2);
        assert!(summary.interrupted);
    }

    #[test]
    fn test_pause_stops_reading() {
        let display = Arc::new(RecordingDisplay::default());
        let script = vec![Some(ControlSignal::PauseToggle), None, None, Some(ControlSignal::Quit)];
        let (mut c, _) = consumer(script, display.clone());
        let sink = Arc::new(MemorySink::default());
        let locator = ScriptedLocator::default().with(1, vec![probe_at(100.0, 100.0, &[1.0, 0.0, 0.0])]);
        let pipeline = patrol_pipeline(locator, sink.clone(), 1);
        let mut source = marked_frames(&[0, 1, 1], 25.0);

        let summary = c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert_eq!(summary.frames_read, 1, "no frames read while paused");
        assert!(sink.events().is_empty(), "no detection while paused");
    }

    #[test]
    fn test_seek_back_from_start_stays_at_start() {
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, _) = consumer(
            vec![Some(ControlSignal::SeekBack), Some(ControlSignal::Quit)],
            display.clone(),
        );
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = marked_frames(&[0; 10], 25.0);

        c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        let indices: Vec<u64> = display.shown().iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![0, 0]);
    }

    #[test]
    fn test_seek_forward_past_end_lands_on_last_frame() {
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, _) = consumer(
            vec![Some(ControlSignal::SeekForward), Some(ControlSignal::Quit)],
            display.clone(),
        );
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        // 5 s at 25 fps is 125 frames, far past the end.
        let mut source = marked_frames(&[0; 10], 25.0);

        c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        let indices: Vec<u64> = display.shown().iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![0, 9]);
    }

    #[test]
    fn test_looping_source_keeps_clock_moving() {
        let display = Arc::new(RecordingDisplay::default());
        let mut script = vec![None; 6];
        script.push(Some(ControlSignal::Quit));
        let (mut c, _) = consumer(script, display.clone());
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = LoopingSource(marked_frames(&[0; 3], 10.0));

        c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        let shown = display.shown();
        let indices: Vec<u64> = shown.iter().map(|f| f.frame_index).collect();
        // The rewind takes one control poll of its own.
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(shown[3].timestamp, origin() + chrono::Duration::milliseconds(300));
        assert!(shown.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_empty_looping_source_fails_instead_of_spinning() {
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, monitor) = consumer(vec![Some(ControlSignal::Quit)], display.clone());
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = LoopingSource(marked_frames(&[], 25.0));

        let result = c.run(&pipeline, &mut source, SourceClock::new(origin()));
        assert!(matches!(result, Err(PipelineError::Source(_))), "got {result:?}");
        assert_eq!(monitor.snapshot().state, PipelineState::Stopped);
        assert!(display.released());
        assert!(display.shown().is_empty());
    }

    #[test]
    fn test_rewind_still_polls_for_quit() {
        let display = Arc::new(RecordingDisplay::default());
        // Quit lands on the poll right after the first rewind.
        let script = vec![None, None, Some(ControlSignal::Quit)];
        let (mut c, _) = consumer(script, display.clone());
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = LoopingSource(marked_frames(&[0; 2], 25.0));

        let summary = c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.frames_read, 2);
    }

    #[test]
    fn test_persistent_read_failure_is_an_error() {
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, monitor) = consumer(vec![], display.clone());
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);

        let result = c.run(&pipeline, &mut BrokenSource, SourceClock::new(origin()));
        match result {
            Err(PipelineError::Source(SourceError::Decode(message))) => {
                assert_eq!(message, "device unplugged")
            }
            other => panic!("expected the last read error, got {other:?}"),
        }
        assert_eq!(monitor.snapshot().state, PipelineState::Stopped);
        assert!(display.released());
    }

    #[test]
    fn test_detection_failure_does_not_stop_run() {
        let display = Arc::new(RecordingDisplay::default());
        let (mut c, _) = consumer(vec![], display.clone());
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = marked_frames(&[0, FAIL_MARKER, 0], 25.0);

        let summary = c.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert_eq!(summary.frames_read, 3);
    }
}
