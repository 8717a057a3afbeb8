use crate::interactive::ControlSignal;
use crate::pipeline::{FrameConsumer, PatrolPipeline, PipelineError, RunSummary, SourceClock};
use patrol_hw::FrameSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Clone-safe handle for asking the pipeline thread to stop.
///
/// Covers both consumers: the interactive one sees `Quit` on its control
/// channel, the batch one sees the stop flag before claiming its next batch.
#[derive(Clone)]
pub struct StopHandle {
    control: Sender<ControlSignal>,
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new(control: Sender<ControlSignal>, stop: Arc<AtomicBool>) -> Self {
        Self { control, stop }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // The receiver is gone once the run is over; nothing left to stop.
        let _ = self.control.send(ControlSignal::Quit);
    }
}

pub struct PipelineHandle {
    stopper: StopHandle,
    done: oneshot::Receiver<Result<RunSummary, PipelineError>>,
}

impl PipelineHandle {
    pub fn stopper(&self) -> StopHandle {
        self.stopper.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunSummary, PipelineError> {
        self.done
            .await
            .map_err(|_| PipelineError::Thread("pipeline thread exited without a result".into()))?
    }
}

/// Run `consumer` over `source` on a dedicated OS thread.
///
/// The consumers block (frame pacing, decoding, the worker pool), so they
/// stay off the async runtime. The run result comes back over a oneshot.
pub fn spawn_pipeline(
    pipeline: PatrolPipeline,
    mut source: Box<dyn FrameSource>,
    mut consumer: Box<dyn FrameConsumer>,
    clock: SourceClock,
    stopper: StopHandle,
) -> Result<PipelineHandle, PipelineError> {
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("patrol-pipeline".into())
        .spawn(move || {
            tracing::info!("pipeline thread started");
            let result = consumer.run(&pipeline, source.as_mut(), clock);
            if let Err(e) = &result {
                tracing::error!(error = %e, "pipeline run failed");
            }
            let _ = tx.send(result);
            tracing::info!("pipeline thread exiting");
        })
        .map_err(|e| PipelineError::Thread(e.to_string()))?;

    Ok(PipelineHandle { stopper, done: rx })
}
