//! Champion selection over trained-family metrics records.
//!
//! Compares held-out (test split) MAE across every record in the metrics
//! directory and persists a single versioned descriptor. Ties break on the
//! metrics file name, so a fixed set of records always selects the same
//! champion.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::write_atomic;
use crate::metrics::{read_metrics_dir, MetricsError, ModelMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// One champion across all families and targets jointly.
    Joint,
    /// One winner per target; the persisted descriptor is the winner for
    /// the configured serving target.
    PerTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub policy: SelectionPolicy,
    pub serving_target: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::Joint,
            serving_target: "sum_energy_wh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionDescriptor {
    pub model_type: String,
    pub model_path: String,
    pub target: String,
    pub test_mae: f64,
    pub source_metrics_file: String,
    pub selection_policy: SelectionPolicy,
    /// Monotonic: previous persisted version + 1. Lets a racing overwrite be
    /// detected after the fact; concurrent selector runs still require
    /// external mutual exclusion.
    pub version: u64,
    pub selected_at_ts_ms: i64,
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no usable metrics records found under {dir} (policy {policy:?}, target '{target}')")]
    NoMetrics {
        dir: String,
        policy: SelectionPolicy,
        target: String,
    },
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("descriptor serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Picks the winning record without persisting anything.
pub fn select_champion(
    metrics_dir: &Path,
    cfg: &SelectionConfig,
) -> Result<(String, ModelMetrics), SelectionError> {
    let records = read_metrics_dir(metrics_dir)?;

    let mut candidates: Vec<(String, ModelMetrics, f64)> = records
        .into_iter()
        .filter(|(_, metrics)| match cfg.policy {
            SelectionPolicy::Joint => true,
            SelectionPolicy::PerTarget => metrics.target == cfg.serving_target,
        })
        .filter_map(|(name, metrics)| {
            let test = metrics.test_metrics()?;
            let mae = test.mae;
            mae.is_finite().then_some((name, metrics, mae))
        })
        .collect();

    candidates.sort_by(|(name_a, _, mae_a), (name_b, _, mae_b)| {
        mae_a.total_cmp(mae_b).then_with(|| name_a.cmp(name_b))
    });

    let Some((name, metrics, mae)) = candidates.into_iter().next() else {
        return Err(SelectionError::NoMetrics {
            dir: metrics_dir.display().to_string(),
            policy: cfg.policy,
            target: cfg.serving_target.clone(),
        });
    };

    info!(
        component = "champion",
        event = "champion.selected",
        metrics_file = %name,
        model_type = %metrics.model_type,
        target = %metrics.target,
        test_mae = mae,
        policy = ?cfg.policy
    );

    Ok((name, metrics))
}

/// Selects and persists the versioned descriptor, overwriting any previous
/// one atomically. `now_ms` is injected so repeated selection over a fixed
/// metrics set stays reproducible in tests.
pub fn select_and_persist(
    metrics_dir: &Path,
    champion_path: &Path,
    cfg: &SelectionConfig,
    now_ms: i64,
) -> Result<ChampionDescriptor, SelectionError> {
    let (source_file, metrics) = select_champion(metrics_dir, cfg)?;

    let previous_version = load_descriptor(champion_path)
        .ok()
        .map(|descriptor| descriptor.version)
        .unwrap_or(0);

    let test_mae = metrics
        .test_metrics()
        .map(|m| m.mae)
        .unwrap_or(f64::INFINITY);
    let descriptor = ChampionDescriptor {
        model_type: metrics.model_type,
        model_path: metrics.model_path,
        target: metrics.target,
        test_mae,
        source_metrics_file: source_file,
        selection_policy: cfg.policy,
        version: previous_version + 1,
        selected_at_ts_ms: now_ms,
    };

    let bytes = serde_json::to_vec_pretty(&descriptor)?;
    write_atomic(champion_path, &bytes)?;

    info!(
        component = "champion",
        event = "champion.persisted",
        path = %champion_path.display(),
        model_type = %descriptor.model_type,
        version = descriptor.version
    );

    Ok(descriptor)
}

pub fn load_descriptor(path: &Path) -> Result<ChampionDescriptor, SelectionError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
