//! Chronological train/val/test assignment per link group.
//!
//! Assignment is a pure function of (group size, fractions); it never reads
//! feature or target values. Within every group all train rows precede all
//! val rows, which precede all test rows in time order.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::FeatureTable;

pub const FRACTION_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitFractions {
    pub train_frac: f64,
    pub val_frac: f64,
    pub test_frac: f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self {
            train_frac: 0.7,
            val_frac: 0.15,
            test_frac: 0.15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub groups: u64,
    pub train_rows: u64,
    pub val_rows: u64,
    pub test_rows: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("split fraction {name} is not finite: {value}")]
    NonFiniteFraction { name: &'static str, value: f64 },
    #[error("split fraction {name} out of range [0, 1]: {value}")]
    FractionOutOfRange { name: &'static str, value: f64 },
    #[error("split fractions must sum to 1 (±{FRACTION_SUM_TOLERANCE}), got {sum}")]
    BadFractionSum { sum: f64 },
    #[error("train_frac must be > 0, got {0}")]
    EmptyTrainFraction(f64),
}

pub fn validate_fractions(fracs: &SplitFractions) -> Result<(), SplitError> {
    let named = [
        ("train_frac", fracs.train_frac),
        ("val_frac", fracs.val_frac),
        ("test_frac", fracs.test_frac),
    ];
    for (name, value) in named {
        if !value.is_finite() {
            return Err(SplitError::NonFiniteFraction { name, value });
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(SplitError::FractionOutOfRange { name, value });
        }
    }

    let sum = fracs.train_frac + fracs.val_frac + fracs.test_frac;
    if (sum - 1.0).abs() > FRACTION_SUM_TOLERANCE {
        return Err(SplitError::BadFractionSum { sum });
    }
    if fracs.train_frac <= 0.0 {
        return Err(SplitError::EmptyTrainFraction(fracs.train_frac));
    }
    Ok(())
}

/// Segment sizes (train, val, test) for a group of `n` rows.
///
/// A single-row group goes entirely to test. For n >= 2 both val and test
/// keep at least one row even when the fractional allocation rounds to
/// zero, so no split is ever silently empty; train may be empty only for
/// n == 2.
pub fn split_sizes(n: usize, fracs: &SplitFractions) -> (usize, usize, usize) {
    if n == 0 {
        return (0, 0, 0);
    }
    if n == 1 {
        return (0, 0, 1);
    }

    let mut train_end = ((n as f64 * fracs.train_frac).floor() as usize).max(1);
    let mut val_end =
        ((n as f64 * (fracs.train_frac + fracs.val_frac)).floor() as usize).max(train_end + 1);
    if val_end > n - 1 {
        val_end = n - 1;
    }
    if train_end >= val_end {
        train_end = val_end - 1;
    }

    (train_end, val_end - train_end, n - val_end)
}

/// Labels every row of the table, group by group in time order.
pub fn assign_splits(
    table: &mut FeatureTable,
    fracs: &SplitFractions,
) -> Result<SplitSummary, SplitError> {
    validate_fractions(fracs)?;

    let mut summary = SplitSummary::default();
    let ranges = table.group_ranges();
    summary.groups = ranges.len() as u64;

    for (start, end) in ranges {
        let (n_train, n_val, n_test) = split_sizes(end - start, fracs);
        for (offset, row) in table.rows[start..end].iter_mut().enumerate() {
            let split = if offset < n_train {
                Split::Train
            } else if offset < n_train + n_val {
                Split::Val
            } else {
                Split::Test
            };
            row.split = Some(split);
        }
        summary.train_rows += n_train as u64;
        summary.val_rows += n_val as u64;
        summary.test_rows += n_test as u64;
    }

    info!(
        component = "split",
        event = "split.assign.finish",
        groups = summary.groups,
        train_rows = summary.train_rows,
        val_rows = summary.val_rows,
        test_rows = summary.test_rows
    );

    Ok(summary)
}
