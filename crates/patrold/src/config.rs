use patrol_core::{MatchThreshold, ThresholdError, ZoneBounds};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_DISTANCE: f64 = 0.8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("threshold: {0}")]
    Threshold(#[from] ThresholdError),
    #[error("{0}")]
    Invalid(String),
}

/// How cooldown entries are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// One window per guard, across all zones.
    #[default]
    Identity,
    /// One window per (guard, zone) pair.
    IdentityZone,
}

impl FromStr for CooldownScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "identity_zone" => Ok(Self::IdentityZone),
            other => Err(ConfigError::InvalidValue {
                key: "cooldown_scope".into(),
                value: other.into(),
            }),
        }
    }
}

/// One configuration layer. Later layers override earlier ones field by field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub db_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub embedding_dim: Option<usize>,
    pub max_distance: Option<f64>,
    pub min_confidence: Option<f64>,
    pub cooldown_secs: Option<u64>,
    pub cooldown_scope: Option<CooldownScope>,
    pub min_face_size: Option<u32>,
    pub zone_radius_default: Option<f64>,
    pub zone_radius_min: Option<f64>,
    pub zone_radius_max: Option<f64>,
    pub seek_step_secs: Option<f64>,
    pub frame_stride: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub headless: Option<bool>,
}

impl ConfigLayer {
    /// Read `PATROL_*` variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Ok(Self {
            db_path: get("PATROL_DB_PATH").map(PathBuf::from),
            model_dir: get("PATROL_MODEL_DIR").map(PathBuf::from),
            embedding_dim: parse(&get, "PATROL_EMBEDDING_DIM")?,
            max_distance: parse(&get, "PATROL_MAX_DISTANCE")?,
            min_confidence: parse(&get, "PATROL_MIN_CONFIDENCE")?,
            cooldown_secs: parse(&get, "PATROL_COOLDOWN_SECS")?,
            cooldown_scope: get("PATROL_COOLDOWN_SCOPE")
                .map(|v| v.parse())
                .transpose()?,
            min_face_size: parse(&get, "PATROL_MIN_FACE_SIZE")?,
            zone_radius_default: parse(&get, "PATROL_ZONE_RADIUS_DEFAULT")?,
            zone_radius_min: parse(&get, "PATROL_ZONE_RADIUS_MIN")?,
            zone_radius_max: parse(&get, "PATROL_ZONE_RADIUS_MAX")?,
            seek_step_secs: parse(&get, "PATROL_SEEK_STEP_SECS")?,
            frame_stride: parse(&get, "PATROL_FRAME_STRIDE")?,
            batch_size: parse(&get, "PATROL_BATCH_SIZE")?,
            max_workers: parse(&get, "PATROL_MAX_WORKERS")?,
            headless: get("PATROL_HEADLESS").map(|v| v != "0" && v != "false"),
        })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(self, other: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            db_path: other.db_path.or(self.db_path),
            model_dir: other.model_dir.or(self.model_dir),
            embedding_dim: other.embedding_dim.or(self.embedding_dim),
            max_distance: other.max_distance.or(self.max_distance),
            min_confidence: other.min_confidence.or(self.min_confidence),
            cooldown_secs: other.cooldown_secs.or(self.cooldown_secs),
            cooldown_scope: other.cooldown_scope.or(self.cooldown_scope),
            min_face_size: other.min_face_size.or(self.min_face_size),
            zone_radius_default: other.zone_radius_default.or(self.zone_radius_default),
            zone_radius_min: other.zone_radius_min.or(self.zone_radius_min),
            zone_radius_max: other.zone_radius_max.or(self.zone_radius_max),
            seek_step_secs: other.seek_step_secs.or(self.seek_step_secs),
            frame_stride: other.frame_stride.or(self.frame_stride),
            batch_size: other.batch_size.or(self.batch_size),
            max_workers: other.max_workers.or(self.max_workers),
            headless: other.headless.or(self.headless),
        }
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|v| {
            v.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
            })
        })
        .transpose()
}

/// Daemon configuration, resolved from environment, file, and flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding roster, zones, and arrivals.
    pub db_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Embedding length shared by the locator and the roster.
    pub embedding_dim: usize,
    pub threshold: MatchThreshold,
    pub cooldown: Duration,
    pub cooldown_scope: CooldownScope,
    /// Faces smaller than this in either dimension are ignored.
    pub min_face_size: u32,
    pub zone_bounds: ZoneBounds,
    /// Interactive seek distance.
    pub seek_step: Duration,
    /// Run detection on every Nth frame.
    pub frame_stride: u64,
    pub batch_size: usize,
    pub max_workers: usize,
    pub headless: bool,
}

impl Config {
    /// Environment, then the file named by `PATROL_CONFIG` or `config_file`,
    /// then `overrides`.
    pub fn load(config_file: Option<&Path>, overrides: ConfigLayer) -> Result<Self, ConfigError> {
        Self::load_from(|k| std::env::var(k).ok(), config_file, overrides)
    }

    /// [`Config::load`] with the environment read through `lookup`.
    pub fn load_from(
        lookup: impl Fn(&str) -> Option<String>,
        config_file: Option<&Path>,
        overrides: ConfigLayer,
    ) -> Result<Self, ConfigError> {
        let env = ConfigLayer::from_lookup(&lookup)?;
        let file_path = config_file
            .map(Path::to_path_buf)
            .or_else(|| lookup("PATROL_CONFIG").filter(|v| !v.is_empty()).map(PathBuf::from));

        let mut layer = env;
        if let Some(path) = file_path {
            tracing::info!(path = %path.display(), "loading config file");
            layer = layer.merge(ConfigLayer::from_toml_file(&path)?);
        }
        Self::resolve(layer.merge(overrides))
    }

    /// Apply defaults and validate.
    pub fn resolve(layer: ConfigLayer) -> Result<Self, ConfigError> {
        let defaults = ZoneBounds::default();
        let zone_bounds = ZoneBounds {
            default_radius: layer.zone_radius_default.unwrap_or(defaults.default_radius),
            min_radius: layer.zone_radius_min.unwrap_or(defaults.min_radius),
            max_radius: layer.zone_radius_max.unwrap_or(defaults.max_radius),
        };
        if !(zone_bounds.min_radius > 0.0 && zone_bounds.min_radius <= zone_bounds.max_radius) {
            return Err(ConfigError::Invalid(format!(
                "zone radius band [{}, {}] is empty",
                zone_bounds.min_radius, zone_bounds.max_radius
            )));
        }
        if !zone_bounds.contains(zone_bounds.default_radius) {
            return Err(ConfigError::Invalid(format!(
                "default zone radius {} outside [{}, {}]",
                zone_bounds.default_radius, zone_bounds.min_radius, zone_bounds.max_radius
            )));
        }

        let threshold =
            MatchThreshold::resolve(layer.max_distance, layer.min_confidence, DEFAULT_MAX_DISTANCE)?;

        let seek_step_secs = layer.seek_step_secs.unwrap_or(5.0);
        if !(seek_step_secs.is_finite() && seek_step_secs > 0.0) {
            return Err(invalid("seek_step_secs", seek_step_secs));
        }

        let config = Self {
            db_path: layer.db_path.unwrap_or_else(patrol_store::default_db_path),
            model_dir: layer.model_dir.unwrap_or_else(patrol_core::default_model_dir),
            embedding_dim: positive("embedding_dim", layer.embedding_dim.unwrap_or(512))?,
            threshold,
            cooldown: Duration::from_secs(layer.cooldown_secs.unwrap_or(300)),
            cooldown_scope: layer.cooldown_scope.unwrap_or_default(),
            min_face_size: layer.min_face_size.unwrap_or(20),
            zone_bounds,
            seek_step: Duration::from_secs_f64(seek_step_secs),
            frame_stride: positive("frame_stride", layer.frame_stride.unwrap_or(1))?,
            batch_size: positive("batch_size", layer.batch_size.unwrap_or(32))?,
            max_workers: positive("max_workers", layer.max_workers.unwrap_or(8))?,
            headless: layer.headless.unwrap_or(false),
        };
        Ok(config)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(patrol_core::SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(patrol_core::ARCFACE_MODEL_FILE)
    }
}

fn invalid(key: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn positive<T: PartialEq + Default + std::fmt::Display>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(invalid(key, value));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> ConfigLayer {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigLayer::from_lookup(|k| map.get(k).cloned()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(ConfigLayer::default()).unwrap();
        assert_eq!(config.embedding_dim, 512);
        assert!((config.threshold.max_distance() - 0.8).abs() < 1e-12);
        assert_eq!(config.cooldown, Duration::from_secs(300));
        assert_eq!(config.cooldown_scope, CooldownScope::Identity);
        assert_eq!(config.zone_bounds, ZoneBounds::default());
        assert_eq!(config.seek_step, Duration::from_secs(5));
        assert_eq!((config.frame_stride, config.batch_size, config.max_workers), (1, 32, 8));
        assert!(!config.headless);
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_env_values() {
        let layer = env(&[
            ("PATROL_COOLDOWN_SECS", "60"),
            ("PATROL_COOLDOWN_SCOPE", "identity_zone"),
            ("PATROL_MIN_CONFIDENCE", "0.4"),
            ("PATROL_HEADLESS", "1"),
        ]);
        let config = Config::resolve(layer).unwrap();
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert_eq!(config.cooldown_scope, CooldownScope::IdentityZone);
        assert!((config.threshold.max_distance() - 0.6).abs() < 1e-12);
        assert!(config.headless);
    }

    #[test]
    fn test_unparsable_env_is_error() {
        let result = ConfigLayer::from_lookup(|k| (k == "PATROL_BATCH_SIZE").then(|| "lots".into()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_file_overrides_env_and_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.toml");
        std::fs::write(&path, "cooldown_secs = 120\nbatch_size = 8\n").unwrap();

        let layer = env(&[("PATROL_COOLDOWN_SECS", "60"), ("PATROL_BATCH_SIZE", "4")])
            .merge(ConfigLayer::from_toml_file(&path).unwrap())
            .merge(ConfigLayer {
                batch_size: Some(2),
                ..Default::default()
            });
        let config = Config::resolve(layer).unwrap();
        assert_eq!(config.cooldown, Duration::from_secs(120));
        assert_eq!(config.batch_size, 2);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.toml");
        std::fs::write(&path, "cooldown = 5\n").unwrap();
        assert!(matches!(
            ConfigLayer::from_toml_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_inconsistent_thresholds_rejected() {
        let layer = ConfigLayer {
            max_distance: Some(0.6),
            min_confidence: Some(0.5),
            ..Default::default()
        };
        assert!(matches!(Config::resolve(layer), Err(ConfigError::Threshold(_))));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let layer = ConfigLayer {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(layer),
            Err(ConfigError::InvalidValue { key, .. }) if key == "batch_size"
        ));
    }

    #[test]
    fn test_config_file_named_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.toml");
        std::fs::write(&path, "zone_radius_max = 150.0\n").unwrap();
        let file = path.to_string_lossy().into_owned();

        let config = Config::load_from(
            |k| match k {
                "PATROL_CONFIG" => Some(file.clone()),
                "PATROL_ZONE_RADIUS_MIN" => Some("40".into()),
                _ => None,
            },
            None,
            ConfigLayer::default(),
        )
        .unwrap();
        assert_eq!(config.zone_bounds.min_radius, 40.0);
        assert_eq!(config.zone_bounds.max_radius, 150.0);
    }

    #[test]
    fn test_inverted_radius_band_rejected() {
        let layer = ConfigLayer {
            zone_radius_min: Some(300.0),
            zone_radius_max: Some(100.0),
            ..Default::default()
        };
        assert!(matches!(Config::resolve(layer), Err(ConfigError::Invalid(_))));
    }
}
