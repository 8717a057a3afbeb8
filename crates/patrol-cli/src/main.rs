use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use patrol_core::{FaceLocator, OnnxFaceLocator, Point};
use patrol_store::{ArrivalFilter, ArrivalRecord, NewZone, SqliteStore};
use patrold::config::{Config, ConfigLayer};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `MonitorProxy` for the daemon's control surface.
#[zbus::proxy(
    interface = "org.patrol.Monitor1",
    default_service = "org.patrol.Monitor1",
    default_path = "/org/patrol/Monitor1"
)]
trait Monitor {
    async fn quit(&self) -> zbus::Result<()>;
    async fn toggle_pause(&self) -> zbus::Result<()>;
    async fn seek_back(&self) -> zbus::Result<()>;
    async fn seek_forward(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn current_frame(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "patrolctl", about = "Patrol monitor CLI")]
struct Cli {
    /// SQLite database path (default: PATROL_DB_PATH, then the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML config file shared with patrold (overrides PATROL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pause or resume the running monitor
    Pause,
    /// Seek the running monitor back by one step
    SeekBack,
    /// Seek the running monitor forward by one step
    SeekForward,
    /// Stop the running monitor
    Quit,
    /// Show monitor status
    Status,
    /// Show annotations of the frame currently on screen
    Frame,
    /// Query recorded arrivals, newest first
    Records {
        /// Only arrivals at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only arrivals at or before this RFC 3339 time
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Only arrivals of this guard
        #[arg(long)]
        identity: Option<String>,
        /// Only arrivals at this zone
        #[arg(long)]
        zone: Option<i64>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage patrol zones
    Zone {
        #[command(subcommand)]
        command: ZoneCommands,
    },
    /// Enrol a guard from a still image containing exactly one face
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        image: PathBuf,
        /// Directory holding the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ZoneCommands {
    /// Add a zone; the radius defaults and is clamped to the allowed band
    Add {
        #[arg(long)]
        camera: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        x: f64,
        #[arg(long)]
        y: f64,
        #[arg(long)]
        radius: Option<f64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List the zones of a camera
    List {
        #[arg(long)]
        camera: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_file = cli.config.clone();
    let flags = overrides(&cli);
    let settings = move || {
        Config::load(config_file.as_deref(), flags.clone()).context("invalid configuration")
    };

    match cli.command {
        Commands::Pause => monitor().await?.toggle_pause().await?,
        Commands::SeekBack => monitor().await?.seek_back().await?,
        Commands::SeekForward => monitor().await?.seek_forward().await?,
        Commands::Quit => monitor().await?.quit().await?,
        Commands::Status => {
            let status = monitor().await?.status().await?;
            println!("{}", pretty_json(&status)?);
        }
        Commands::Frame => {
            let frame = monitor().await?.current_frame().await?;
            println!("{}", pretty_json(&frame)?);
        }
        Commands::Records {
            since,
            until,
            identity,
            zone,
            limit,
            json,
        } => {
            let store = open_store(&settings()?)?;
            let records = store.query_arrivals(&ArrivalFilter {
                since,
                until,
                identity_id: identity,
                zone_id: zone,
                limit: Some(limit),
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No arrivals recorded");
            } else {
                for record in &records {
                    println!("{}", format_record(record));
                }
            }
        }
        Commands::Zone { command } => {
            let config = settings()?;
            let store = open_store(&config)?;
            match command {
                ZoneCommands::Add {
                    camera,
                    name,
                    x,
                    y,
                    radius,
                    description,
                } => {
                    let zone = store.add_zone(
                        &NewZone {
                            camera_id: camera,
                            name,
                            center: Point::new(x, y),
                            radius,
                            description,
                        },
                        &config.zone_bounds,
                    )?;
                    println!(
                        "Added zone {} \"{}\" on {} at ({}, {}) r={}",
                        zone.id, zone.name, zone.camera_id, zone.center.x, zone.center.y, zone.radius
                    );
                }
                ZoneCommands::List { camera } => {
                    let zones = store.list_zones(&camera)?;
                    if zones.is_empty() {
                        println!("No zones for camera {camera}");
                    }
                    for zone in zones {
                        println!(
                            "{:>4}  {:<20} ({:.0}, {:.0}) r={:.0}",
                            zone.id, zone.name, zone.center.x, zone.center.y, zone.radius
                        );
                    }
                }
            }
        }
        Commands::Enroll { name, image, .. } => {
            let config = settings()?;
            let store = open_store(&config)?;
            let id = enroll(&store, &config, &name, &image)?;
            println!("Enrolled {name} as {id}");
        }
    }

    Ok(())
}

async fn monitor() -> Result<MonitorProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    MonitorProxy::new(&conn)
        .await
        .context("patrold is not running")
}

/// Flag values that override the environment and config file.
fn overrides(cli: &Cli) -> ConfigLayer {
    let model_dir = match &cli.command {
        Commands::Enroll { model_dir, .. } => model_dir.clone(),
        _ => None,
    };
    ConfigLayer {
        db_path: cli.db.clone(),
        model_dir,
        ..ConfigLayer::default()
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    let path = &config.db_path;
    SqliteStore::open(path).with_context(|| format!("opening {}", path.display()))
}

fn enroll(store: &SqliteStore, config: &Config, name: &str, image: &Path) -> Result<String> {
    let locator = OnnxFaceLocator::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        0,
        config.embedding_dim,
    )
    .with_context(|| format!("loading models from {}", config.model_dir.display()))?;

    let rgb = image::open(image)
        .with_context(|| format!("reading {}", image.display()))?
        .to_rgb8();
    let probes = locator.locate(rgb.as_raw(), rgb.width(), rgb.height())?;
    let probe = match probes.as_slice() {
        [probe] => probe,
        [] => bail!("no face found in {}", image.display()),
        many => bail!("{} faces found in {}; exactly one is required", many.len(), image.display()),
    };

    Ok(store.enroll_identity(name, &probe.embedding, Utc::now())?)
}

fn pretty_json(raw: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

fn format_record(record: &ArrivalRecord) -> String {
    format!(
        "{}  {} ({})  zone {} ({})",
        record.arrived_at.format("%Y-%m-%d %H:%M:%S"),
        record.identity_id,
        record.identity_name.as_deref().unwrap_or("unknown"),
        record.zone_id,
        record.zone_name.as_deref().unwrap_or("removed"),
    )
}
