//! Headless batch consumer.
//!
//! The whole source is decoded up front, then split into fixed-size batches
//! that a rayon pool works through. Workers claim batches from a shared
//! counter, so batches finish out of order; event timestamps come from each
//! frame's source position and are unaffected.

use crate::pipeline::{
    FrameConsumer, PatrolPipeline, PipelineError, PipelineState, RunSummary, SourceClock,
    StateMachine,
};
use crate::status::Monitor;
use patrol_hw::FrameSource;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Worker count: `max_workers`, capped by available parallelism, at least 1.
pub fn worker_count(max_workers: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    available.min(max_workers).max(1)
}

pub struct BatchConsumer {
    batch_size: usize,
    workers: usize,
    stop: Arc<AtomicBool>,
    monitor: Arc<Monitor>,
}

impl BatchConsumer {
    pub fn new(batch_size: usize, workers: usize, stop: Arc<AtomicBool>, monitor: Arc<Monitor>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            stop,
            monitor,
        }
    }
}

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    processed: AtomicU64,
    arrivals: AtomicU64,
}

impl FrameConsumer for BatchConsumer {
    fn run(
        &mut self,
        pipeline: &PatrolPipeline,
        source: &mut dyn FrameSource,
        clock: SourceClock,
    ) -> Result<RunSummary, PipelineError> {
        let mut state = StateMachine::new(self.monitor.clone());
        state.advance(PipelineState::Running)?;

        tracing::info!(source = %source.describe(), "decoding source");
        let frames = source.decode_all()?;
        let total = frames.len();
        let batches = total.div_ceil(self.batch_size);
        tracing::info!(
            frames = total,
            batches,
            batch_size = self.batch_size,
            workers = self.workers,
            "batch run started"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("patrol-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::Pool(e.to_string()))?;

        let next_batch = AtomicUsize::new(0);
        let counters = Counters::default();
        let batch_size = self.batch_size;
        let stop = &self.stop;
        let monitor = &self.monitor;

        pool.scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|_| loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let batch = next_batch.fetch_add(1, Ordering::SeqCst);
                    if batch >= batches {
                        break;
                    }

                    let start = batch * batch_size;
                    let end = (start + batch_size).min(total);
                    for index in start..end {
                        let frame = match frames.load(index) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::warn!(frame = index, error = %e, "failed to load decoded frame");
                                continue;
                            }
                        };
                        counters.read.fetch_add(1, Ordering::Relaxed);
                        if !pipeline.should_process(frame.index) {
                            continue;
                        }
                        let report = pipeline.process_frame(&frame, clock.timestamp(&frame));
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        counters.arrivals.fetch_add(report.recorded(), Ordering::Relaxed);
                    }

                    monitor.set_progress(
                        counters.read.load(Ordering::Relaxed),
                        Some(total as u64),
                        pipeline.recorder().recorded_count(),
                    );
                    tracing::debug!(batch, start, end, "batch done");
                });
            }
        });

        let interrupted = self.stop.load(Ordering::SeqCst) && next_batch.load(Ordering::SeqCst) < batches;
        let summary = RunSummary {
            frames_read: counters.read.into_inner(),
            frames_processed: counters.processed.into_inner(),
            arrivals: counters.arrivals.into_inner(),
            interrupted,
        };
        state.advance(PipelineState::Stopped)?;

        if interrupted {
            tracing::warn!(frames = summary.frames_read, total, "batch run interrupted");
        } else {
            tracing::info!(
                frames = summary.frames_read,
                processed = summary.frames_processed,
                arrivals = summary.arrivals,
                "batch run finished"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interactive::InteractiveConsumer;
    use crate::status::{MonitorStatus, Profile};
    use crate::test_support::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn monitor() -> Arc<Monitor> {
        Arc::new(Monitor::new(MonitorStatus::new(Profile::Headless, "mem", "cam1")))
    }

    /// G1 walks through Z1 (frames 10-11), leaves, and G2 stands in Z2
    /// (frames 30-33) only.
    fn scenario() -> (ScriptedLocator, Vec<u8>) {
        let locator = ScriptedLocator::default()
            .with(1, vec![probe_at(100.0, 100.0, &[1.0, 0.0, 0.0])])
            .with(2, vec![probe_at(170.0, 100.0, &[0.0, 1.0, 0.0])]);
        let mut markers = vec![0u8; 40];
        markers[10] = 1;
        markers[11] = 1;
        for m in &mut markers[30..34] {
            *m = 2;
        }
        (locator, markers)
    }

    fn run_batch(workers: usize, batch_size: usize) -> (Arc<MemorySink>, RunSummary) {
        let (locator, markers) = scenario();
        let sink = Arc::new(MemorySink::default());
        let pipeline = patrol_pipeline(locator, sink.clone(), 1);
        let mut source = marked_frames(&markers, 25.0);
        let mut consumer = BatchConsumer::new(batch_size, workers, Arc::new(AtomicBool::new(false)), monitor());
        let summary = consumer.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        (sink, summary)
    }

    fn keys(sink: &MemorySink) -> BTreeSet<(String, i64)> {
        sink.events()
            .into_iter()
            .map(|e| (e.identity_id, e.zone_id))
            .collect()
    }

    #[test]
    fn test_single_worker_matches_interactive() {
        let (batch_sink, summary) = run_batch(1, 8);
        assert_eq!(summary.frames_read, 40);
        assert!(!summary.interrupted);

        let (locator, markers) = scenario();
        let interactive_sink = Arc::new(MemorySink::default());
        let pipeline = patrol_pipeline(locator, interactive_sink.clone(), 1);
        let mut source = marked_frames(&markers, 25.0);
        let mut consumer = InteractiveConsumer::new(
            ScriptedControl::default(),
            Arc::new(RecordingDisplay::default()),
            monitor(),
            Duration::from_secs(5),
        );
        consumer.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();

        assert_eq!(batch_sink.events(), interactive_sink.events(), "same events, same timestamps");
        assert_eq!(
            keys(&batch_sink),
            BTreeSet::from([("G1".to_string(), 1), ("G2".to_string(), 2)])
        );
    }

    #[test]
    fn test_parallel_workers_do_not_double_record() {
        let (sink, summary) = run_batch(4, 1);
        assert_eq!(summary.frames_read, 40);
        assert_eq!(sink.events().len(), 2, "one event per identity despite concurrent frames");
        assert_eq!(
            keys(&sink),
            BTreeSet::from([("G1".to_string(), 1), ("G2".to_string(), 2)])
        );
        for event in sink.events() {
            assert!(event.timestamp >= origin() + chrono::Duration::milliseconds(400));
            assert!(event.timestamp <= origin() + chrono::Duration::milliseconds(1320));
        }
    }

    #[test]
    fn test_stop_before_start_is_interrupted() {
        let (locator, markers) = scenario();
        let sink = Arc::new(MemorySink::default());
        let pipeline = patrol_pipeline(locator, sink.clone(), 1);
        let mut source = marked_frames(&markers, 25.0);
        let mon = monitor();
        let mut consumer = BatchConsumer::new(8, 2, Arc::new(AtomicBool::new(true)), mon.clone());

        let summary = consumer.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.frames_read, 0);
        assert!(sink.events().is_empty());
        assert_eq!(mon.snapshot().state, PipelineState::Stopped);
    }

    #[test]
    fn test_frame_stride_applies_to_source_index() {
        let sink = Arc::new(MemorySink::default());
        let locator = ScriptedLocator::default().with(1, vec![probe_at(100.0, 100.0, &[1.0, 0.0, 0.0])]);
        let pipeline = patrol_pipeline(locator, sink.clone(), 2);
        // G1 only on odd frames, which a stride of 2 never samples.
        let mut source = marked_frames(&[0, 1, 0, 1, 0, 1], 25.0);
        let mut consumer = BatchConsumer::new(2, 2, Arc::new(AtomicBool::new(false)), monitor());

        let summary = consumer.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert_eq!(summary.frames_read, 6);
        assert_eq!(summary.frames_processed, 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_empty_source_finishes_cleanly() {
        let pipeline = patrol_pipeline(ScriptedLocator::default(), Arc::new(MemorySink::default()), 1);
        let mut source = marked_frames(&[], 25.0);
        let mut consumer = BatchConsumer::new(8, 2, Arc::new(AtomicBool::new(true)), monitor());
        let summary = consumer.run(&pipeline, &mut source, SourceClock::new(origin())).unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(worker_count(0), 1);
        assert!(worker_count(8) <= 8);
        assert!(worker_count(8) >= 1);
    }
}
