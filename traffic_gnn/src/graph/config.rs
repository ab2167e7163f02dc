use crate::graph::error::ConfigError;
use burn::config::Config;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable holding the comma separated device ordinals.
pub const DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Filter widths shared by every backbone block. Missing keys take their
/// defaults when the experiment file is read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackboneConfig {
    #[serde(default = "default_filters")]
    pub num_chev_filters: usize,
    #[serde(default = "default_filters")]
    pub num_time_filters: usize,
    /// Output channels per forecast step, carried by the hour branch only.
    #[serde(default = "default_one")]
    pub num_features: usize,
}

fn default_filters() -> usize {
    64
}

fn default_one() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

impl BackboneConfig {
    pub fn new() -> Self {
        Self {
            num_chev_filters: default_filters(),
            num_time_filters: default_filters(),
            num_features: default_one(),
        }
    }

    pub fn with_num_chev_filters(mut self, num_chev_filters: usize) -> Self {
        self.num_chev_filters = num_chev_filters;
        self
    }

    pub fn with_num_time_filters(mut self, num_time_filters: usize) -> Self {
        self.num_time_filters = num_time_filters;
        self
    }

    pub fn with_num_features(mut self, num_features: usize) -> Self {
        self.num_features = num_features;
        self
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for BackboneConfig {}

impl fmt::Display for BackboneConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?)
    }
}

#[derive(Config, Debug)]
pub struct DataConfig {
    pub adj_filename: String,
    pub node_pos_filename: String,
    pub data_dir: String,
    pub points_per_hour: usize,
    pub num_for_predict: usize,
    pub num_of_vertices: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub k: usize,
    pub num_of_weeks: usize,
    pub num_of_days: usize,
    pub num_of_hours: usize,
    pub model_name: String,
    pub optimizer: String,
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub merge: bool,
    /// Ground-truth magnitudes at or below this are left out of MAPE.
    pub mape_epsilon: f32,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub params_dir: Option<String>,
    /// Relative names land inside the params directory.
    #[serde(default)]
    pub prediction_filename: Option<String>,
    #[serde(default)]
    pub kernel_cache: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_one")]
    pub num_workers: usize,
}

impl Config for TrainingConfig {}

impl fmt::Display for TrainingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?)
    }
}

#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub data: DataConfig,
    pub training: TrainingConfig,
}

impl ExperimentConfig {
    /// Loads and validates a JSON experiment file.
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ExperimentConfig::load(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ExperimentConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Load {
                path: PathBuf::from("<inline>"),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.training.validate()?;

        if self.data.num_for_predict == 0 {
            return Err(ConfigError::invalid_value("num_for_predict", "must be >= 1"));
        }
        if self.data.points_per_hour == 0 {
            return Err(ConfigError::invalid_value("points_per_hour", "must be >= 1"));
        }
        if self.data.num_of_vertices == Some(0) {
            return Err(ConfigError::invalid_value("num_of_vertices", "must be >= 1"));
        }
        Ok(())
    }
}

impl TrainingConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        k: usize,
        num_of_weeks: usize,
        num_of_days: usize,
        num_of_hours: usize,
        model_name: String,
        optimizer: String,
        learning_rate: f64,
        epochs: usize,
        batch_size: usize,
        merge: bool,
        mape_epsilon: f32,
        backbone: BackboneConfig,
    ) -> Self {
        Self {
            k,
            num_of_weeks,
            num_of_days,
            num_of_hours,
            model_name,
            optimizer,
            learning_rate,
            epochs,
            batch_size,
            merge,
            mape_epsilon,
            backbone,
            params_dir: None,
            prediction_filename: None,
            kernel_cache: None,
            seed: default_seed(),
            num_workers: default_one(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k < 1 {
            return Err(ConfigError::invalid_value("k", "Chebyshev order must be >= 1"));
        }
        for (field, value) in [
            ("num_of_weeks", self.num_of_weeks),
            ("num_of_days", self.num_of_days),
            ("num_of_hours", self.num_of_hours),
            ("batch_size", self.batch_size),
            ("num_workers", self.num_workers),
            ("backbone.num_chev_filters", self.backbone.num_chev_filters),
            ("backbone.num_time_filters", self.backbone.num_time_filters),
            ("backbone.num_features", self.backbone.num_features),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be >= 1"));
            }
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value(
                "learning_rate",
                format!("{} is not a positive number", self.learning_rate),
            ));
        }
        if !(self.mape_epsilon.is_finite() && self.mape_epsilon >= 0.0) {
            return Err(ConfigError::invalid_value(
                "mape_epsilon",
                format!("{} is not a non-negative number", self.mape_epsilon),
            ));
        }
        self.model_kind()?;
        self.optimizer_kind()?;
        Ok(())
    }

    pub fn model_kind(&self) -> Result<ModelKind, ConfigError> {
        self.model_name.parse()
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, ConfigError> {
        self.optimizer.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Mstgcn,
    Astgcn,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Mstgcn => "MSTGCN",
            ModelKind::Astgcn => "ASTGCN",
        }
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MSTGCN" => Ok(ModelKind::Mstgcn),
            "ASTGCN" => Ok(ModelKind::Astgcn),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

/// Parses a device list such as `"0,2,3"`. Blank or absent means no explicit
/// devices, in which case callers fall back to the default device.
pub fn parse_device_ordinals(value: Option<&str>) -> Result<Vec<usize>, ConfigError> {
    let value = match value.map(str::trim) {
        None | Some("") => return Ok(Vec::new()),
        Some(v) => v,
    };

    value
        .split(',')
        .map(|token| {
            token
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::DeviceList(value.to_string()))
        })
        .collect()
}

pub fn resolve_devices<D: Clone>(ordinals: &[usize], to_device: impl Fn(usize) -> D, fallback: D) -> Vec<D> {
    if ordinals.is_empty() {
        vec![fallback]
    } else {
        ordinals.iter().map(|&i| to_device(i)).collect()
    }
}

/// `{params_dir}/{model_name}` when configured, otherwise a timestamped
/// directory under `params/`.
pub fn resolve_params_dir(training: &TrainingConfig, now: DateTime<Local>) -> PathBuf {
    match training.params_dir.as_deref() {
        Some(dir) if dir != "None" => Path::new(dir).join(&training.model_name),
        _ => PathBuf::from(format!(
            "params/{}_{}",
            training.model_name,
            now.format("%Y%m%d%H%M%S")
        )),
    }
}

pub fn prepare_params_dir(path: &Path, force: bool) -> Result<(), ConfigError> {
    if path.exists() {
        if !force {
            return Err(ConfigError::ParamsDirExists(path.to_path_buf()));
        }
        std::fs::remove_dir_all(path).map_err(|source| ConfigError::ParamsDir {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::create_dir_all(path).map_err(|source| ConfigError::ParamsDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPERIMENT: &str = r#"{
        "data": {
            "adj_filename": "data/adj.npz",
            "node_pos_filename": "data/node_pos.npy",
            "data_dir": "data",
            "points_per_hour": 12,
            "num_for_predict": 3
        },
        "training": {
            "k": 3,
            "num_of_weeks": 1,
            "num_of_days": 1,
            "num_of_hours": 3,
            "model_name": "ASTGCN",
            "optimizer": "adam",
            "learning_rate": 0.001,
            "epochs": 10,
            "batch_size": 16,
            "merge": false,
            "mape_epsilon": 0.001,
            "backbone": { "num_chev_filters": 16, "num_time_filters": 16, "num_features": 3 }
        }
    }"#;

    #[test]
    fn parses_full_experiment_with_defaults() {
        let config = ExperimentConfig::from_json(EXPERIMENT).unwrap();
        assert_eq!(config.training.k, 3);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.num_workers, 1);
        assert_eq!(config.training.params_dir, None);
        assert_eq!(config.training.backbone.num_features, 3);
        assert_eq!(config.training.model_kind().unwrap(), ModelKind::Astgcn);
        assert_eq!(config.training.optimizer_kind().unwrap(), OptimizerKind::Adam);
    }

    #[test]
    fn experiment_file_without_optional_keys_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        let json = EXPERIMENT.replace(
            r#""backbone": { "num_chev_filters": 16, "num_time_filters": 16, "num_features": 3 }"#,
            r#""backbone": { "num_chev_filters": 16 }"#,
        );
        std::fs::write(&path, json).unwrap();

        let config = ExperimentConfig::load_validated(&path).unwrap();
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.num_workers, 1);
        assert_eq!(config.training.kernel_cache, None);
        assert_eq!(config.training.backbone.num_chev_filters, 16);
        assert_eq!(config.training.backbone.num_time_filters, 64);
        assert_eq!(config.training.backbone.num_features, 1);

        let saved = dir.path().join("saved.json");
        config.save(&saved).unwrap();
        let reloaded = ExperimentConfig::load_validated(&saved).unwrap();
        assert_eq!(reloaded.training.seed, config.training.seed);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let json = EXPERIMENT.replace("\"k\": 3,", "");
        assert!(matches!(ExperimentConfig::from_json(&json), Err(ConfigError::Load { .. })));
    }

    #[test]
    fn non_numeric_value_is_a_config_error() {
        let json = EXPERIMENT.replace("\"num_of_days\": 1", "\"num_of_days\": \"one\"");
        assert!(matches!(ExperimentConfig::from_json(&json), Err(ConfigError::Load { .. })));
    }

    #[test]
    fn zero_order_is_rejected() {
        let json = EXPERIMENT.replace("\"k\": 3", "\"k\": 0");
        assert!(matches!(
            ExperimentConfig::from_json(&json),
            Err(ConfigError::InvalidValue { field: "k", .. })
        ));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let json = EXPERIMENT.replace("ASTGCN", "GCN");
        assert!(matches!(ExperimentConfig::from_json(&json), Err(ConfigError::UnknownModel(_))));
    }

    #[test]
    fn device_list_parsing() {
        assert!(parse_device_ordinals(None).unwrap().is_empty());
        assert!(parse_device_ordinals(Some("  ")).unwrap().is_empty());
        assert_eq!(parse_device_ordinals(Some("0, 2,3")).unwrap(), vec![0, 2, 3]);
        assert!(matches!(parse_device_ordinals(Some("0,gpu1")), Err(ConfigError::DeviceList(_))));

        assert_eq!(resolve_devices(&[], |i| i + 100, 7), vec![7]);
        assert_eq!(resolve_devices(&[1, 2], |i| i + 100, 7), vec![101, 102]);
    }

    #[test]
    fn params_dir_resolution() {
        let mut config = ExperimentConfig::from_json(EXPERIMENT).unwrap().training;
        let now = Local::now();
        let dir = resolve_params_dir(&config, now);
        assert!(dir.starts_with("params"));
        assert!(dir.to_string_lossy().contains("ASTGCN_"));

        config.params_dir = Some("runs".to_string());
        assert_eq!(resolve_params_dir(&config, now), PathBuf::from("runs/ASTGCN"));
    }

    #[test]
    fn params_dir_is_not_reused_without_force() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("MSTGCN");
        prepare_params_dir(&dir, false).unwrap();
        std::fs::write(dir.join("stale.params"), b"x").unwrap();

        assert!(matches!(prepare_params_dir(&dir, false), Err(ConfigError::ParamsDirExists(_))));
        prepare_params_dir(&dir, true).unwrap();
        assert!(!dir.join("stale.params").exists());
    }
}
