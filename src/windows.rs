//! Sequence sample construction for window-input model families.
//!
//! Slices a chronologically ordered feature matrix into fixed-length
//! (window, horizon, stride) samples: sample i covers rows
//! `[i, i + window)` and predicts the target at row
//! `i + window + horizon - 1`. Samples with a non-finite target are
//! discarded; non-finite feature cells are zero-filled so one bad feature
//! does not destroy a usable label.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::features::{write_atomic, FeatureTable};
use crate::split::Split;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceParams {
    pub window: usize,
    pub horizon: usize,
    pub stride: usize,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            window: 60,
            horizon: 1,
            stride: 1,
        }
    }
}

/// Flat row-major sample tensor: sample i, step t, feature f lives at
/// `x[(i * window + t) * n_features + f]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSamples {
    pub n_samples: usize,
    pub window: usize,
    pub n_features: usize,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

impl SequenceSamples {
    pub fn sample(&self, i: usize) -> &[f32] {
        let stride = self.window * self.n_features;
        &self.x[i * stride..(i + 1) * stride]
    }

    pub fn step(&self, i: usize, t: usize) -> &[f32] {
        let base = (i * self.window + t) * self.n_features;
        &self.x[base..base + self.n_features]
    }
}

/// Recorded next to the tensors; inference must present windows in exactly
/// this feature order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowManifest {
    pub feature_order: Vec<String>,
    pub target: String,
    pub window: usize,
    pub horizon: usize,
    pub stride: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowingReport {
    pub input_rows: u64,
    pub raw_samples: u64,
    pub dropped_nonfinite_target: u64,
    pub zero_filled_cells: u64,
    pub output_samples: u64,
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("invalid sequence params: {0}")]
    InvalidParams(String),
    #[error("feature matrix rows have inconsistent width at row {row}: expected {expected}, got {actual}")]
    RaggedInput {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("feature/target length mismatch: {features} feature rows vs {targets} targets")]
    LengthMismatch { features: usize, targets: usize },
    #[error(
        "no usable sequence samples: {raw_samples} built, {dropped_nonfinite_target} dropped for non-finite targets"
    )]
    NoUsableSamples {
        raw_samples: u64,
        dropped_nonfinite_target: u64,
    },
    #[error("target column '{0}' not present in feature schema")]
    TargetMissing(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization error: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub fn validate_sequence_params(params: &SequenceParams) -> Result<(), WindowError> {
    if params.window == 0 {
        return Err(WindowError::InvalidParams("window must be > 0".to_string()));
    }
    if params.horizon == 0 {
        return Err(WindowError::InvalidParams(
            "horizon must be > 0".to_string(),
        ));
    }
    if params.stride == 0 {
        return Err(WindowError::InvalidParams("stride must be > 0".to_string()));
    }
    Ok(())
}

/// Windows one chronologically ordered series. Fails fast when zero usable
/// samples remain after cleaning.
pub fn build_windows(
    features: &[Vec<f64>],
    targets: &[f64],
    feature_names: &[String],
    target_name: &str,
    params: &SequenceParams,
) -> Result<(SequenceSamples, WindowManifest, WindowingReport), WindowError> {
    validate_sequence_params(params)?;

    let n_features = feature_names.len();
    for (row, values) in features.iter().enumerate() {
        if values.len() != n_features {
            return Err(WindowError::RaggedInput {
                row,
                expected: n_features,
                actual: values.len(),
            });
        }
    }
    if features.len() != targets.len() {
        return Err(WindowError::LengthMismatch {
            features: features.len(),
            targets: targets.len(),
        });
    }

    let mut samples = SequenceSamples {
        n_samples: 0,
        window: params.window,
        n_features,
        x: Vec::new(),
        y: Vec::new(),
    };
    let mut report = WindowingReport {
        input_rows: features.len() as u64,
        ..WindowingReport::default()
    };

    append_windows(features, targets, params, &mut samples, &mut report);

    if samples.n_samples == 0 {
        return Err(WindowError::NoUsableSamples {
            raw_samples: report.raw_samples,
            dropped_nonfinite_target: report.dropped_nonfinite_target,
        });
    }

    report.output_samples = samples.n_samples as u64;
    let manifest = build_manifest(feature_names, target_name, params);

    info!(
        component = "windows",
        event = "windows.build.finish",
        input_rows = report.input_rows,
        raw_samples = report.raw_samples,
        dropped_nonfinite_target = report.dropped_nonfinite_target,
        zero_filled_cells = report.zero_filled_cells,
        output_samples = report.output_samples
    );

    Ok((samples, manifest, report))
}

/// Windows every link group's rows for one split of the feature table,
/// concatenating samples across groups. Rows never cross a group boundary.
pub fn build_split_windows(
    table: &FeatureTable,
    target_name: &str,
    split: Split,
    params: &SequenceParams,
) -> Result<(SequenceSamples, WindowManifest, WindowingReport), WindowError> {
    validate_sequence_params(params)?;

    let target_idx = table
        .schema
        .column_index(target_name)
        .ok_or_else(|| WindowError::TargetMissing(target_name.to_string()))?;
    let feature_names: Vec<String> = table
        .schema
        .columns
        .iter()
        .filter(|name| name.as_str() != target_name)
        .cloned()
        .collect();

    let mut samples = SequenceSamples {
        n_samples: 0,
        window: params.window,
        n_features: feature_names.len(),
        x: Vec::new(),
        y: Vec::new(),
    };
    let mut report = WindowingReport::default();

    for (start, end) in table.group_ranges() {
        let mut group_features = Vec::new();
        let mut group_targets = Vec::new();
        for row in &table.rows[start..end] {
            if row.split != Some(split) {
                continue;
            }
            let mut values = Vec::with_capacity(row.values.len() - 1);
            for (idx, value) in row.values.iter().enumerate() {
                if idx == target_idx {
                    continue;
                }
                values.push(value.unwrap_or(f64::NAN));
            }
            group_features.push(values);
            group_targets.push(row.values[target_idx].unwrap_or(f64::NAN));
        }

        report.input_rows += group_features.len() as u64;
        append_windows(&group_features, &group_targets, params, &mut samples, &mut report);
    }

    if samples.n_samples == 0 {
        return Err(WindowError::NoUsableSamples {
            raw_samples: report.raw_samples,
            dropped_nonfinite_target: report.dropped_nonfinite_target,
        });
    }

    report.output_samples = samples.n_samples as u64;
    let manifest = build_manifest(&feature_names, target_name, params);

    info!(
        component = "windows",
        event = "windows.split.finish",
        split = split.as_str(),
        input_rows = report.input_rows,
        output_samples = report.output_samples,
        dropped_nonfinite_target = report.dropped_nonfinite_target,
        zero_filled_cells = report.zero_filled_cells
    );

    Ok((samples, manifest, report))
}

fn append_windows(
    features: &[Vec<f64>],
    targets: &[f64],
    params: &SequenceParams,
    samples: &mut SequenceSamples,
    report: &mut WindowingReport,
) {
    let n = features.len();
    let needed = params.window + params.horizon;
    if n < needed {
        return;
    }

    let mut start = 0usize;
    while start + needed <= n {
        report.raw_samples += 1;
        let y = targets[start + params.window + params.horizon - 1];
        if !y.is_finite() {
            report.dropped_nonfinite_target += 1;
            start += params.stride;
            continue;
        }

        for row in &features[start..start + params.window] {
            for &value in row {
                if value.is_finite() {
                    samples.x.push(value as f32);
                } else {
                    report.zero_filled_cells += 1;
                    samples.x.push(0.0);
                }
            }
        }
        samples.y.push(y as f32);
        samples.n_samples += 1;
        start += params.stride;
    }
}

fn build_manifest(
    feature_names: &[String],
    target_name: &str,
    params: &SequenceParams,
) -> WindowManifest {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "target:{target_name};window:{};horizon:{};stride:{};features:",
        params.window, params.horizon, params.stride
    ));
    for name in feature_names {
        hasher.update(name.as_bytes());
        hasher.update(";");
    }

    WindowManifest {
        feature_order: feature_names.to_vec(),
        target: target_name.to_string(),
        window: params.window,
        horizon: params.horizon,
        stride: params.stride,
        fingerprint: hex::encode(hasher.finalize()),
    }
}

pub fn write_manifest(path: &Path, manifest: &WindowManifest) -> Result<(), WindowError> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<WindowManifest, WindowError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
