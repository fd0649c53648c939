//! Held-out metric computation and the per-family metrics records the
//! selector compares.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::features::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub smape: f64,
}

/// One record per trained family per target, written by the (external)
/// trainer to the metrics directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_type: String,
    pub model_path: String,
    pub target: String,
    pub feature_names: Vec<String>,
    /// Keyed by split name ("train" / "val" / "test").
    pub splits: BTreeMap<String, SplitMetrics>,
    pub n_train: u64,
    pub n_test: u64,
}

impl ModelMetrics {
    pub fn test_metrics(&self) -> Option<&SplitMetrics> {
        self.splits.get("test")
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics directory not found: {0}")]
    DirMissing(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub fn mae(y_true: &[f64], y_pred: &[f64]) -> f64 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    let n = y_true.len() as f64;
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs())
        .sum::<f64>()
        / n
}

pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    let n = y_true.len() as f64;
    (y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| {
            let d = t - p;
            d * d
        })
        .sum::<f64>()
        / n)
        .sqrt()
}

/// Symmetric MAPE with the zero-denominator guard: terms where
/// (|t| + |p|) / 2 == 0 use denominator 1.
pub fn smape(y_true: &[f64], y_pred: &[f64]) -> f64 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    let n = y_true.len() as f64;
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| {
            let denom = (t.abs() + p.abs()) / 2.0;
            let denom = if denom == 0.0 { 1.0 } else { denom };
            (t - p).abs() / denom
        })
        .sum::<f64>()
        / n
}

pub fn split_metrics(y_true: &[f64], y_pred: &[f64]) -> SplitMetrics {
    SplitMetrics {
        mae: mae(y_true, y_pred),
        rmse: rmse(y_true, y_pred),
        smape: smape(y_true, y_pred),
    }
}

pub fn write_metrics(path: &Path, metrics: &ModelMetrics) -> Result<(), MetricsError> {
    let bytes = serde_json::to_vec_pretty(metrics)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Reads every `.json` metrics record in the directory, sorted by file name
/// for deterministic downstream selection. Unreadable records are skipped
/// with a warning, not fatal.
pub fn read_metrics_dir(dir: &Path) -> Result<Vec<(String, ModelMetrics)>, MetricsError> {
    if !dir.is_dir() {
        return Err(MetricsError::DirMissing(dir.to_path_buf()));
    }

    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            (entry.path().is_file() && name.ends_with(".json")).then_some(name)
        })
        .collect();
    names.sort();

    let mut records = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let bytes = fs::read(&path)?;
        match serde_json::from_slice::<ModelMetrics>(&bytes) {
            Ok(metrics) => records.push((name, metrics)),
            Err(err) => {
                warn!(
                    component = "metrics",
                    event = "metrics.record.skipped",
                    path = %path.display(),
                    reason = %err
                );
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mae_and_rmse_match_hand_computation() {
        let y_true = [1.0, 2.0, 3.0];
        let y_pred = [1.0, 1.0, 5.0];
        assert!((mae(&y_true, &y_pred) - 1.0).abs() < 1e-12);
        assert!((rmse(&y_true, &y_pred) - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn smape_guards_the_zero_denominator() {
        let y_true = [0.0];
        let y_pred = [0.0];
        assert_eq!(smape(&y_true, &y_pred), 0.0);

        let y_true = [2.0];
        let y_pred = [2.0];
        assert_eq!(smape(&y_true, &y_pred), 0.0);

        let y_true = [1.0];
        let y_pred = [3.0];
        assert!((smape(&y_true, &y_pred) - 1.0).abs() < 1e-12);
    }
}
