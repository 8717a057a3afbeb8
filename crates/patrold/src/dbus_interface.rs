use crate::interactive::ControlSignal;
use crate::status::Monitor;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.patrol.Monitor1";
pub const OBJECT_PATH: &str = "/org/patrol/Monitor1";

/// D-Bus control and display surface for the patrol monitor.
///
/// Bus name: org.patrol.Monitor1
/// Object path: /org/patrol/Monitor1
pub struct MonitorService {
    control: Sender<ControlSignal>,
    monitor: Arc<Monitor>,
}

impl MonitorService {
    pub fn new(control: Sender<ControlSignal>, monitor: Arc<Monitor>) -> Self {
        Self { control, monitor }
    }

    fn send(&self, signal: ControlSignal) -> zbus::fdo::Result<()> {
        tracing::info!(?signal, "control signal received");
        self.control
            .send(signal)
            .map_err(|_| zbus::fdo::Error::Failed("pipeline is no longer running".into()))
    }
}

#[interface(name = "org.patrol.Monitor1")]
impl MonitorService {
    /// Stop the run.
    async fn quit(&self) -> zbus::fdo::Result<()> {
        self.send(ControlSignal::Quit)
    }

    /// Pause a running pipeline, or resume a paused one.
    async fn toggle_pause(&self) -> zbus::fdo::Result<()> {
        self.send(ControlSignal::PauseToggle)
    }

    async fn seek_back(&self) -> zbus::fdo::Result<()> {
        self.send(ControlSignal::SeekBack)
    }

    async fn seek_forward(&self) -> zbus::fdo::Result<()> {
        self.send(ControlSignal::SeekForward)
    }

    /// Return monitor status as a JSON document.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.monitor.snapshot())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return the annotations of the frame on screen as JSON, or `null`.
    async fn current_frame(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.monitor.last_frame())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
