use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use patrol_core::{ArrivalSink, FaceLocator, NearestMatcher, OnnxFaceLocator, ZoneSource};
use patrol_hw::FrameSource;
use patrol_store::SqliteStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use tracing_subscriber::EnvFilter;

use patrold::batch::{self, BatchConsumer};
use patrold::config::{Config, ConfigLayer};
use patrold::dbus_interface::{MonitorService, BUS_NAME, OBJECT_PATH};
use patrold::engine::{self, StopHandle};
use patrold::interactive::{ControlSignal, InteractiveConsumer};
use patrold::pipeline::{enforce_zone_bounds, FrameConsumer, PatrolPipeline, PipelineError, SourceClock};
use patrold::recorder::PatrolRecorder;
use patrold::roster::Roster;
use patrold::status::{Monitor, MonitorStatus, Profile};

/// Exit status when a headless run was stopped before the source ran out.
const EXIT_INTERRUPTED: u8 = 2;

#[derive(Parser)]
#[command(name = "patrold", about = "Patrol monitor daemon", version)]
struct Args {
    /// Video file, still image, or V4L2 device (/dev/videoN)
    source: PathBuf,

    /// Camera whose patrol zones apply to this source
    #[arg(long, default_value = "default")]
    camera_id: String,

    /// Force the headless batch profile
    #[arg(long)]
    headless: bool,

    /// Replay a video file endlessly, as a live feed
    #[arg(long = "loop")]
    looping: bool,

    /// TOML config file (overrides PATROL_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// RFC 3339 wall-clock time of the first frame of a file source
    #[arg(long)]
    source_start: Option<DateTime<Utc>>,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory holding the ONNX models
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("patrold failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "patrold starting");

    let overrides = ConfigLayer {
        db_path: args.db.clone(),
        model_dir: args.model_dir.clone(),
        headless: args.headless.then_some(true),
        ..ConfigLayer::default()
    };
    let config = Config::load(args.config.as_deref(), overrides).context("invalid configuration")?;

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    tracing::info!(path = %config.db_path.display(), "database opened");

    let roster = Arc::new(Roster::load(store.as_ref(), config.embedding_dim)?);
    if roster.is_empty() {
        tracing::warn!("roster is empty; no arrivals can be recorded");
    }

    let zones = store
        .zones_for_camera(&args.camera_id)
        .map_err(|e| PipelineError::Zones {
            camera: args.camera_id.clone(),
            message: e.to_string(),
        })?;
    let zones = enforce_zone_bounds(zones, &config.zone_bounds);
    if zones.is_empty() {
        tracing::warn!(camera = %args.camera_id, "no patrol zones configured for camera");
    }
    tracing::info!(camera = %args.camera_id, zones = zones.len(), "zones loaded");

    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let locator: Arc<dyn FaceLocator> = Arc::new(
        OnnxFaceLocator::load(
            &scrfd_path,
            &arcface_path,
            config.min_face_size,
            config.embedding_dim,
        )
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?,
    );
    tracing::info!(scrfd = %scrfd_path.display(), arcface = %arcface_path.display(), "models loaded");

    let source = patrol_hw::source::open_source(&args.source, args.looping)
        .with_context(|| format!("opening source {}", args.source.display()))?;
    tracing::info!(
        source = %source.describe(),
        fps = source.fps(),
        frames = ?source.frame_count(),
        live = source.is_live(),
        "source opened"
    );

    let base_status = MonitorStatus {
        roster_size: roster.len(),
        zone_count: zones.len(),
        total_frames: source.frame_count(),
        ..MonitorStatus::new(
            Profile::Interactive,
            &source.describe(),
            &args.camera_id,
        )
    };

    let (control_tx, control_rx) = mpsc::channel::<ControlSignal>();
    let stop = Arc::new(AtomicBool::new(false));

    // The connection must outlive the run to keep serving the interface.
    let (profile, monitor, _connection) = if config.headless {
        tracing::info!("headless profile forced");
        (Profile::Headless, None, None)
    } else {
        let monitor = Arc::new(Monitor::new(base_status.clone()));
        match serve_monitor(control_tx.clone(), monitor.clone()).await {
            Ok(connection) => {
                tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
                (Profile::Interactive, Some(monitor), Some(connection))
            }
            Err(e) => {
                tracing::warn!(error = %e, "no display surface on the session bus; running headless");
                (Profile::Headless, None, None)
            }
        }
    };
    let monitor = monitor.unwrap_or_else(|| {
        Arc::new(Monitor::new(MonitorStatus {
            profile: Profile::Headless,
            ..base_status
        }))
    });

    let consumer: Box<dyn FrameConsumer> = match profile {
        Profile::Interactive => Box::new(InteractiveConsumer::new(
            control_rx,
            monitor.clone(),
            monitor.clone(),
            config.seek_step,
        )),
        Profile::Headless if source.is_live() => {
            // Nothing to decode up front; consume frame by frame until stopped.
            tracing::info!("live source in headless profile, consuming sequentially");
            Box::new(InteractiveConsumer::new(
                control_rx,
                monitor.clone(),
                monitor.clone(),
                config.seek_step,
            ))
        }
        Profile::Headless => Box::new(BatchConsumer::new(
            config.batch_size,
            batch::worker_count(config.max_workers),
            stop.clone(),
            monitor.clone(),
        )),
    };

    let recorder = PatrolRecorder::new(
        roster.clone(),
        store.clone() as Arc<dyn ArrivalSink>,
        config.cooldown,
        config.cooldown_scope,
    );
    let pipeline = PatrolPipeline::new(
        roster,
        zones,
        Box::new(NearestMatcher::new(config.threshold)),
        locator,
        recorder,
        config.frame_stride,
    );

    let clock = SourceClock::new(args.source_start.unwrap_or_else(Utc::now));
    let handle = engine::spawn_pipeline(
        pipeline,
        source,
        consumer,
        clock,
        StopHandle::new(control_tx, stop),
    )?;
    tracing::info!(profile = ?profile, "patrold ready");

    let stopper = handle.stopper();
    let wait = handle.wait();
    tokio::pin!(wait);
    let mut signalled = false;
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            signal = tokio::signal::ctrl_c(), if !signalled => {
                signalled = true;
                match signal {
                    Ok(()) => {
                        tracing::info!("interrupt received, stopping");
                        stopper.request_stop();
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to listen for interrupt"),
                }
            }
        }
    };

    let summary = result?;
    tracing::info!(
        frames = summary.frames_read,
        processed = summary.frames_processed,
        arrivals = summary.arrivals,
        interrupted = summary.interrupted,
        "patrold shutting down"
    );

    if profile == Profile::Headless && summary.interrupted {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve_monitor(
    control: mpsc::Sender<ControlSignal>,
    monitor: Arc<Monitor>,
) -> zbus::Result<zbus::Connection> {
    zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, MonitorService::new(control, monitor))?
        .build()
        .await
}
