//! Pipeline parameters, loaded from a JSON params file.
//!
//! Every section has defaults, so a missing file (at the default location)
//! runs the reference configuration; `LINKCAST_PARAMS` points at an explicit
//! file, which must then exist.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::aggregate::{validate_aggregate_config, AggregateConfig, AggregateError};
use crate::champion::SelectionConfig;
use crate::features::FeatureParams;
use crate::split::{validate_fractions, SplitError, SplitFractions};
use crate::windows::{validate_sequence_params, SequenceParams, WindowError};

pub const DEFAULT_PARAMS_PATH: &str = "params.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    pub raw_dir: PathBuf,
    pub store_path: PathBuf,
    pub features_path: PathBuf,
    pub windows_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub champion_path: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            store_path: PathBuf::from("data/link_windows.sqlite"),
            features_path: PathBuf::from("data/features/features.csv"),
            windows_dir: PathBuf::from("data/windows"),
            metrics_dir: PathBuf::from("reports/metrics"),
            champion_path: PathBuf::from("models/champion.json"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataPaths,
    pub aggregate: AggregateConfig,
    pub features: FeatureParams,
    pub split: SplitFractions,
    pub seq: SequenceParams,
    pub selection: SelectionConfig,
    /// Canonical column name -> candidate names tried during resolution.
    pub aliases: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("params file not found: {0}")]
    ParamsMissing(PathBuf),
    #[error("failed to read params file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse params file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Seq(#[from] WindowError),
    #[error("no target columns configured")]
    NoTargets,
}

pub fn params_path_from_env() -> (PathBuf, bool) {
    match env::var("LINKCAST_PARAMS") {
        Ok(raw) if !raw.trim().is_empty() => (PathBuf::from(raw.trim()), true),
        _ => (PathBuf::from(DEFAULT_PARAMS_PATH), false),
    }
}

/// Loads and validates the pipeline config. `required` controls whether a
/// missing file is an error (explicit env path) or falls back to defaults
/// (nothing configured).
pub fn load_params(path: &Path, required: bool) -> Result<PipelineConfig, ConfigError> {
    let config = if path.is_file() {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    } else if required {
        return Err(ConfigError::ParamsMissing(path.to_path_buf()));
    } else {
        info!(
            component = "config",
            event = "config.defaults",
            path = %path.display()
        );
        PipelineConfig::default()
    };

    validate_params(&config)?;
    Ok(config)
}

pub fn validate_params(config: &PipelineConfig) -> Result<(), ConfigError> {
    validate_aggregate_config(&config.aggregate)?;
    validate_fractions(&config.split)?;
    validate_sequence_params(&config.seq)?;
    if config.features.targets.is_empty() {
        return Err(ConfigError::NoTargets);
    }
    Ok(())
}
