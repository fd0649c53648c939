//! Champion loading and the capability-polymorphic prediction path.
//!
//! Exactly two model kinds are servable; adding a family means adding a
//! variant here, not branching on strings at call sites. The predictor is a
//! pure read path over persisted artifacts: `predict` takes `&self` and is
//! safe to call from concurrent callers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::champion::{load_descriptor, ChampionDescriptor, SelectionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Tabular,
    Sequence,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tabular => "tabular",
            Self::Sequence => "sequence",
        }
    }
}

pub fn parse_model_type(raw: &str) -> Result<ModelKind, PredictError> {
    match raw {
        "tabular" => Ok(ModelKind::Tabular),
        "sequence" => Ok(ModelKind::Sequence),
        other => Err(PredictError::UnsupportedModelType {
            value: other.to_string(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("unsupported model_type: '{value}'")]
    UnsupportedModelType { value: String },
    #[error("failed to read model artifact {path}: {source}")]
    ArtifactIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse model artifact {path}: {source}")]
    ArtifactParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("model artifact shape invalid: {0}")]
    ArtifactShape(String),
    #[error("window length mismatch: trained window is {expected}, got {actual}")]
    WindowLengthMismatch { expected: usize, actual: usize },
    #[error("window row {row} has {actual} features, expected {expected}")]
    RaggedWindow {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Champion(#[from] SelectionError),
}

/// Linear bundle persisted by tabular trainers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularBundle {
    pub feature_names: Vec<String>,
    pub weights: Vec<f64>,
    pub intercept: f64,
}

#[derive(Debug)]
pub struct TabularPredictor {
    bundle: TabularBundle,
}

impl TabularPredictor {
    pub fn load(path: &Path) -> Result<Self, PredictError> {
        let bundle: TabularBundle = read_json_artifact(path)?;
        Self::from_bundle(bundle)
    }

    pub fn from_bundle(bundle: TabularBundle) -> Result<Self, PredictError> {
        if bundle.weights.len() != bundle.feature_names.len() {
            return Err(PredictError::ArtifactShape(format!(
                "{} weights for {} feature names",
                bundle.weights.len(),
                bundle.feature_names.len()
            )));
        }
        Ok(Self { bundle })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.bundle.feature_names
    }

    /// Aligns the input to the trained feature order; features declared at
    /// training time but absent from the input are padded with 0.0.
    pub fn predict(&self, features: &BTreeMap<String, f64>) -> f64 {
        self.bundle
            .feature_names
            .iter()
            .zip(&self.bundle.weights)
            .map(|(name, weight)| weight * features.get(name).copied().unwrap_or(0.0))
            .sum::<f64>()
            + self.bundle.intercept
    }
}

/// Saved parameters of a single-layer recurrent regressor:
/// `h_t = tanh(W_ih x_t + W_hh h_{t-1} + b_h)`, `y = w_out · h_T + b_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceCheckpoint {
    pub in_features: usize,
    pub hidden_size: usize,
    pub window: usize,
    pub w_ih: Vec<Vec<f64>>,
    pub w_hh: Vec<Vec<f64>>,
    pub b_h: Vec<f64>,
    pub w_out: Vec<f64>,
    pub b_out: f64,
}

/// Flattened row-major weights, built once on first predict.
#[derive(Debug)]
struct RecurrentCell {
    in_features: usize,
    hidden_size: usize,
    w_ih: Vec<f64>,
    w_hh: Vec<f64>,
    b_h: Vec<f64>,
    w_out: Vec<f64>,
    b_out: f64,
}

impl RecurrentCell {
    fn forward(&self, window: &[Vec<f64>]) -> f64 {
        let mut h = vec![0.0f64; self.hidden_size];
        let mut h_next = vec![0.0f64; self.hidden_size];

        for x in window {
            for j in 0..self.hidden_size {
                let mut acc = self.b_h[j];
                let ih_row = &self.w_ih[j * self.in_features..(j + 1) * self.in_features];
                for (weight, value) in ih_row.iter().zip(x) {
                    acc += weight * value;
                }
                let hh_row = &self.w_hh[j * self.hidden_size..(j + 1) * self.hidden_size];
                for (weight, value) in hh_row.iter().zip(&h) {
                    acc += weight * value;
                }
                h_next[j] = acc.tanh();
            }
            std::mem::swap(&mut h, &mut h_next);
        }

        self.w_out.iter().zip(&h).map(|(w, v)| w * v).sum::<f64>() + self.b_out
    }
}

#[derive(Debug)]
pub struct SequencePredictor {
    checkpoint: SequenceCheckpoint,
    cell: OnceLock<RecurrentCell>,
}

impl SequencePredictor {
    pub fn load(path: &Path) -> Result<Self, PredictError> {
        let checkpoint: SequenceCheckpoint = read_json_artifact(path)?;
        Self::from_checkpoint(checkpoint)
    }

    pub fn from_checkpoint(checkpoint: SequenceCheckpoint) -> Result<Self, PredictError> {
        validate_checkpoint(&checkpoint)?;
        Ok(Self {
            checkpoint,
            cell: OnceLock::new(),
        })
    }

    pub fn window(&self) -> usize {
        self.checkpoint.window
    }

    pub fn in_features(&self) -> usize {
        self.checkpoint.in_features
    }

    /// The window must match the trained length exactly — no truncation or
    /// padding — and every step must carry the trained feature width.
    pub fn predict(&self, window: &[Vec<f64>]) -> Result<f64, PredictError> {
        if window.len() != self.checkpoint.window {
            return Err(PredictError::WindowLengthMismatch {
                expected: self.checkpoint.window,
                actual: window.len(),
            });
        }
        for (row, step) in window.iter().enumerate() {
            if step.len() != self.checkpoint.in_features {
                return Err(PredictError::RaggedWindow {
                    row,
                    expected: self.checkpoint.in_features,
                    actual: step.len(),
                });
            }
        }

        let cell = self.cell.get_or_init(|| build_cell(&self.checkpoint));
        Ok(cell.forward(window))
    }
}

#[derive(Debug)]
pub enum PredictorHandle {
    Tabular(TabularPredictor),
    Sequence(SequencePredictor),
}

impl PredictorHandle {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Tabular(_) => ModelKind::Tabular,
            Self::Sequence(_) => ModelKind::Sequence,
        }
    }
}

/// Loads the champion descriptor and the artifact it points at. Dispatch is
/// on the descriptor's `model_type`; an unknown value fails naming it.
pub fn load_champion(champion_path: &Path) -> Result<(ChampionDescriptor, PredictorHandle), PredictError> {
    let descriptor = load_descriptor(champion_path)?;
    let kind = parse_model_type(&descriptor.model_type)?;
    let model_path = Path::new(&descriptor.model_path);

    let handle = match kind {
        ModelKind::Tabular => PredictorHandle::Tabular(TabularPredictor::load(model_path)?),
        ModelKind::Sequence => PredictorHandle::Sequence(SequencePredictor::load(model_path)?),
    };

    info!(
        component = "predict",
        event = "predict.champion.loaded",
        model_type = kind.as_str(),
        model_path = %descriptor.model_path,
        version = descriptor.version
    );

    Ok((descriptor, handle))
}

fn read_json_artifact<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PredictError> {
    let bytes = std::fs::read(path).map_err(|source| PredictError::ArtifactIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| PredictError::ArtifactParse {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_checkpoint(ckpt: &SequenceCheckpoint) -> Result<(), PredictError> {
    if ckpt.in_features == 0 || ckpt.hidden_size == 0 || ckpt.window == 0 {
        return Err(PredictError::ArtifactShape(
            "in_features, hidden_size and window must all be > 0".to_string(),
        ));
    }

    let expect = |label: &str, actual: usize, expected: usize| {
        if actual == expected {
            Ok(())
        } else {
            Err(PredictError::ArtifactShape(format!(
                "{label}: expected {expected}, got {actual}"
            )))
        }
    };

    expect("w_ih rows", ckpt.w_ih.len(), ckpt.hidden_size)?;
    for (idx, row) in ckpt.w_ih.iter().enumerate() {
        expect(&format!("w_ih[{idx}] width"), row.len(), ckpt.in_features)?;
    }
    expect("w_hh rows", ckpt.w_hh.len(), ckpt.hidden_size)?;
    for (idx, row) in ckpt.w_hh.iter().enumerate() {
        expect(&format!("w_hh[{idx}] width"), row.len(), ckpt.hidden_size)?;
    }
    expect("b_h length", ckpt.b_h.len(), ckpt.hidden_size)?;
    expect("w_out length", ckpt.w_out.len(), ckpt.hidden_size)?;
    Ok(())
}

fn build_cell(ckpt: &SequenceCheckpoint) -> RecurrentCell {
    RecurrentCell {
        in_features: ckpt.in_features,
        hidden_size: ckpt.hidden_size,
        w_ih: ckpt.w_ih.iter().flatten().copied().collect(),
        w_hh: ckpt.w_hh.iter().flatten().copied().collect(),
        b_h: ckpt.b_h.clone(),
        w_out: ckpt.w_out.clone(),
        b_out: ckpt.b_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_checkpoint(window: usize) -> SequenceCheckpoint {
        // One hidden unit reading one feature; weights small enough that
        // tanh stays near-linear for the inputs used in tests.
        SequenceCheckpoint {
            in_features: 1,
            hidden_size: 1,
            window,
            w_ih: vec![vec![0.001]],
            w_hh: vec![vec![0.0]],
            b_h: vec![0.0],
            w_out: vec![1000.0],
            b_out: 0.0,
        }
    }

    #[test]
    fn tabular_predict_pads_missing_features_with_zero() {
        let predictor = TabularPredictor::from_bundle(TabularBundle {
            feature_names: vec!["x1".to_string(), "x2".to_string(), "x3".to_string()],
            weights: vec![2.0, 3.0, 100.0],
            intercept: 1.0,
        })
        .expect("bundle is well-formed");

        let mut features = BTreeMap::new();
        features.insert("x1".to_string(), 1.0);
        features.insert("x2".to_string(), 2.0);
        // x3 absent: padded with 0.0, not an error.
        assert_eq!(predictor.predict(&features), 2.0 + 6.0 + 1.0);
    }

    #[test]
    fn tabular_bundle_with_mismatched_weights_is_rejected() {
        let err = TabularPredictor::from_bundle(TabularBundle {
            feature_names: vec!["x1".to_string()],
            weights: vec![1.0, 2.0],
            intercept: 0.0,
        })
        .expect_err("weight/name mismatch");
        assert!(matches!(err, PredictError::ArtifactShape(_)));
    }

    #[test]
    fn sequence_predict_rejects_wrong_window_length() {
        let predictor = SequencePredictor::from_checkpoint(identity_checkpoint(60))
            .expect("checkpoint is well-formed");
        let short: Vec<Vec<f64>> = vec![vec![0.0]; 59];

        let err = predictor.predict(&short).expect_err("59 != 60");
        assert!(matches!(
            err,
            PredictError::WindowLengthMismatch {
                expected: 60,
                actual: 59
            }
        ));
    }

    #[test]
    fn sequence_predict_rejects_ragged_rows() {
        let predictor = SequencePredictor::from_checkpoint(identity_checkpoint(2))
            .expect("checkpoint is well-formed");
        let ragged = vec![vec![0.0], vec![0.0, 1.0]];

        let err = predictor.predict(&ragged).expect_err("row 1 is too wide");
        assert!(matches!(err, PredictError::RaggedWindow { row: 1, .. }));
    }

    #[test]
    fn unknown_model_type_fails_naming_the_value() {
        let err = parse_model_type("gradient-forest").expect_err("unknown kind");
        let message = err.to_string();
        assert!(message.contains("gradient-forest"));
    }

    #[test]
    fn recurrent_forward_is_deterministic_across_calls() {
        let predictor = SequencePredictor::from_checkpoint(identity_checkpoint(3))
            .expect("checkpoint is well-formed");
        let window = vec![vec![0.1], vec![0.2], vec![0.3]];

        let first = predictor.predict(&window).expect("first call");
        let second = predictor.predict(&window).expect("second call");
        assert_eq!(first, second);
        assert!(first.is_finite());
    }
}
