//! Shared windows-to-features transform.
//!
//! Derives lag, trailing-rolling, and calendar columns per link group from
//! the aggregated window table, optionally left-joins an auxiliary KPI
//! series, and stamps the result with a fingerprinted column schema so
//! training and inference agree on feature order.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::WindowRow;
use crate::ingest::parse_utc_timestamp;
use crate::split::Split;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Numeric window-table columns, in schema order.
pub const BASE_NUMERIC_COLUMNS: [&str; 16] = [
    "n_events",
    "sum_data_amount_mb",
    "sum_effective_mb",
    "sum_duration_s",
    "sum_energy_wh",
    "sum_tx_wh",
    "sum_rx_wh",
    "avg_bandwidth_req_mbps",
    "avg_throughput_mbps",
    "avg_jitter_ms",
    "avg_packet_loss_percent",
    "p50_throughput_mbps",
    "p95_packet_loss_percent",
    "energy_wh_per_effective_mb",
    "energy_wh_per_s",
    "throughput_efficiency_ratio",
];

pub const CALENDAR_COLUMNS: [&str; 3] = ["hour", "dow", "month"];

/// Timestamp column candidates tried on the KPI side of the join.
pub const KPI_TIME_CANDIDATES: [&str; 3] = ["window_start_ts", "timestamp", "ts"];
/// Entity key column candidates tried on the KPI side of the join.
pub const KPI_KEY_CANDIDATES: [&str; 3] = ["site", "node", "src_node"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub targets: Vec<String>,
    pub max_lag: u32,
    pub rolling: u32,
    pub kpi_path: Option<PathBuf>,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            targets: vec!["sum_energy_wh".to_string(), "sum_duration_s".to_string()],
            max_lag: 3,
            rolling: 6,
            kpi_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub src_node: String,
    pub dst_node: String,
    pub window_start_ts_ms: i64,
    pub window_end_ts_ms: i64,
    /// Aligned to `FeatureSchema::columns`; `None` cells are expected at
    /// group starts (lags) and on KPI join misses.
    pub values: Vec<Option<f64>>,
    pub split: Option<Split>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    /// Contiguous `[start, end)` row ranges sharing one (src, dst) link.
    pub fn group_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut start = 0usize;
        for idx in 1..=self.rows.len() {
            let boundary = idx == self.rows.len() || {
                let prev = &self.rows[idx - 1];
                let cur = &self.rows[idx];
                prev.src_node != cur.src_node || prev.dst_node != cur.dst_node
            };
            if boundary {
                if idx > start {
                    ranges.push((start, idx));
                }
                start = idx;
            }
        }
        ranges
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KpiJoinStatus {
    NotConfigured,
    SkippedMissingFile {
        path: PathBuf,
    },
    SkippedUnresolvedKeys {
        tried_time: Vec<String>,
        tried_key: Vec<String>,
    },
    Joined {
        kpi_columns: u64,
        matched_rows: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_rows: u64,
    pub groups: u64,
    pub columns: u64,
    pub kpi_status: KpiJoinStatus,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("no target columns configured")]
    NoTargets,
    #[error(
        "target column '{canonical}' not found; tried {tried:?}; available columns: {available:?}"
    )]
    TargetColumnMissing {
        canonical: String,
        tried: Vec<String>,
        available: Vec<String>,
    },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Resolves `canonical` against the column list: exact name first, then each
/// configured alias in order. The error names every candidate tried.
pub fn resolve_column(
    columns: &[String],
    canonical: &str,
    aliases: &BTreeMap<String, Vec<String>>,
) -> Result<usize, FeatureError> {
    let mut tried = vec![canonical.to_string()];
    if let Some(idx) = columns.iter().position(|col| col == canonical) {
        return Ok(idx);
    }

    for candidate in aliases.get(canonical).map(Vec::as_slice).unwrap_or(&[]) {
        tried.push(candidate.clone());
        if let Some(idx) = columns.iter().position(|col| col == candidate) {
            return Ok(idx);
        }
    }

    Err(FeatureError::TargetColumnMissing {
        canonical: canonical.to_string(),
        tried,
        available: columns.to_vec(),
    })
}

pub fn build_features(
    windows: &[WindowRow],
    params: &FeatureParams,
    aliases: &BTreeMap<String, Vec<String>>,
) -> Result<(FeatureTable, FeatureBuildReport), FeatureError> {
    if params.targets.is_empty() {
        return Err(FeatureError::NoTargets);
    }

    info!(
        component = "features",
        event = "features.transform.start",
        input_rows = windows.len(),
        targets = ?params.targets,
        max_lag = params.max_lag,
        rolling = params.rolling
    );

    let columns: Vec<String> = BASE_NUMERIC_COLUMNS
        .iter()
        .map(|name| (*name).to_string())
        .collect();

    let target_indices: Vec<usize> = params
        .targets
        .iter()
        .map(|target| resolve_column(&columns, target, aliases))
        .collect::<Result<_, _>>()?;

    let mut rows: Vec<FeatureRow> = windows.iter().map(base_row).collect();
    rows.sort_by(|a, b| {
        (&a.src_node, &a.dst_node, a.window_start_ts_ms).cmp(&(
            &b.src_node,
            &b.dst_node,
            b.window_start_ts_ms,
        ))
    });

    let mut table = FeatureTable {
        schema: FeatureSchema {
            version: FEATURE_SCHEMA_VERSION,
            fingerprint: String::new(),
            columns,
        },
        rows,
    };
    let group_ranges = table.group_ranges();

    for (target, target_idx) in params.targets.iter().zip(target_indices) {
        append_lag_columns(&mut table, &group_ranges, target, target_idx, params.max_lag);
        if params.rolling > 0 {
            append_rolling_columns(
                &mut table,
                &group_ranges,
                target,
                target_idx,
                params.rolling as usize,
            );
        }
    }

    append_calendar_columns(&mut table)?;

    let kpi_status = match &params.kpi_path {
        None => KpiJoinStatus::NotConfigured,
        Some(path) => join_kpis(&mut table, path)?,
    };

    table.schema.fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &table.schema.columns);

    let report = FeatureBuildReport {
        input_rows: table.rows.len() as u64,
        groups: group_ranges.len() as u64,
        columns: table.schema.columns.len() as u64,
        kpi_status,
    };

    info!(
        component = "features",
        event = "features.transform.finish",
        rows = report.input_rows,
        groups = report.groups,
        columns = report.columns,
        fingerprint = %table.schema.fingerprint,
        kpi_status = ?report.kpi_status
    );

    Ok((table, report))
}

fn base_row(window: &WindowRow) -> FeatureRow {
    FeatureRow {
        src_node: window.src_node.clone(),
        dst_node: window.dst_node.clone(),
        window_start_ts_ms: window.window_start_ts_ms,
        window_end_ts_ms: window.window_end_ts_ms,
        values: vec![
            Some(window.n_events as f64),
            Some(window.sum_data_amount_mb),
            Some(window.sum_effective_mb),
            Some(window.sum_duration_s),
            Some(window.sum_energy_wh),
            Some(window.sum_tx_wh),
            Some(window.sum_rx_wh),
            Some(window.avg_bandwidth_req_mbps),
            Some(window.avg_throughput_mbps),
            Some(window.avg_jitter_ms),
            Some(window.avg_packet_loss_percent),
            Some(window.p50_throughput_mbps),
            Some(window.p95_packet_loss_percent),
            window.energy_wh_per_effective_mb,
            window.energy_wh_per_s,
            window.throughput_efficiency_ratio,
        ],
        split: None,
    }
}

fn append_lag_columns(
    table: &mut FeatureTable,
    group_ranges: &[(usize, usize)],
    target: &str,
    target_idx: usize,
    max_lag: u32,
) {
    for k in 1..=max_lag as usize {
        table.schema.columns.push(format!("{target}_lag_{k}"));
        for &(start, end) in group_ranges {
            for idx in start..end {
                // lag_k is undefined for the first k rows of a group.
                let value = if idx >= start + k {
                    table.rows[idx - k].values[target_idx]
                } else {
                    None
                };
                table.rows[idx].values.push(value);
            }
        }
    }
}

fn append_rolling_columns(
    table: &mut FeatureTable,
    group_ranges: &[(usize, usize)],
    target: &str,
    target_idx: usize,
    rolling: usize,
) {
    table.schema.columns.push(format!("{target}_roll_mean"));
    table.schema.columns.push(format!("{target}_roll_std"));

    for &(start, end) in group_ranges {
        for idx in start..end {
            let window_start = idx.saturating_sub(rolling - 1).max(start);
            let observed: Vec<f64> = (window_start..=idx)
                .filter_map(|i| table.rows[i].values[target_idx])
                .collect();

            let (mean, std) = trailing_mean_std(&observed);
            let row = &mut table.rows[idx];
            row.values.push(mean);
            row.values.push(std);
        }
    }
}

/// Mean needs one observation, sample standard deviation needs two; early
/// rows use as many points as are available.
fn trailing_mean_std(observed: &[f64]) -> (Option<f64>, Option<f64>) {
    if observed.is_empty() {
        return (None, None);
    }
    let n = observed.len() as f64;
    let mean = observed.iter().sum::<f64>() / n;
    if observed.len() < 2 {
        return (Some(mean), None);
    }
    let variance = observed
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    (Some(mean), Some(variance.sqrt()))
}

fn append_calendar_columns(table: &mut FeatureTable) -> Result<(), FeatureError> {
    for name in CALENDAR_COLUMNS {
        table.schema.columns.push(name.to_string());
    }
    for row in &mut table.rows {
        let dt = Utc
            .timestamp_millis_opt(row.window_start_ts_ms)
            .single()
            .ok_or(FeatureError::InvalidTimestamp(row.window_start_ts_ms))?;
        row.values.push(Some(dt.hour() as f64));
        row.values
            .push(Some(dt.weekday().num_days_from_monday() as f64));
        row.values.push(Some(dt.month() as f64));
    }
    Ok(())
}

struct KpiTable {
    value_columns: Vec<String>,
    by_key: HashMap<(String, i64), Vec<Option<f64>>>,
}

fn join_kpis(table: &mut FeatureTable, path: &Path) -> Result<KpiJoinStatus, FeatureError> {
    if !path.is_file() {
        warn!(
            component = "features",
            event = "features.kpi.skipped",
            reason = "file_missing",
            path = %path.display()
        );
        return Ok(KpiJoinStatus::SkippedMissingFile {
            path: path.to_path_buf(),
        });
    }

    let bytes = fs::read(path)?;
    let kpi = match load_kpi_table(&bytes)? {
        Some(kpi) => kpi,
        None => {
            warn!(
                component = "features",
                event = "features.kpi.skipped",
                reason = "join_keys_unresolved",
                path = %path.display()
            );
            return Ok(KpiJoinStatus::SkippedUnresolvedKeys {
                tried_time: KPI_TIME_CANDIDATES.iter().map(|c| c.to_string()).collect(),
                tried_key: KPI_KEY_CANDIDATES.iter().map(|c| c.to_string()).collect(),
            });
        }
    };

    for name in &kpi.value_columns {
        let resolved = if table.schema.columns.iter().any(|col| col == name) {
            format!("{name}_kpi")
        } else {
            name.clone()
        };
        table.schema.columns.push(resolved);
    }

    let mut matched_rows = 0u64;
    for row in &mut table.rows {
        let key = (row.src_node.clone(), row.window_start_ts_ms);
        match kpi.by_key.get(&key) {
            Some(values) => {
                matched_rows += 1;
                row.values.extend_from_slice(values);
            }
            None => row
                .values
                .extend(std::iter::repeat(None).take(kpi.value_columns.len())),
        }
    }

    Ok(KpiJoinStatus::Joined {
        kpi_columns: kpi.value_columns.len() as u64,
        matched_rows,
    })
}

fn load_kpi_table(bytes: &[u8]) -> Result<Option<KpiTable>, FeatureError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(bytes));
    let headers = reader.headers()?.clone();

    let time_idx = KPI_TIME_CANDIDATES
        .iter()
        .find_map(|cand| headers.iter().position(|h| h == *cand));
    let key_idx = KPI_KEY_CANDIDATES
        .iter()
        .find_map(|cand| headers.iter().position(|h| h == *cand));
    let (Some(time_idx), Some(key_idx)) = (time_idx, key_idx) else {
        return Ok(None);
    };

    let value_indices: Vec<usize> = (0..headers.len())
        .filter(|idx| *idx != time_idx && *idx != key_idx)
        .collect();
    let value_columns: Vec<String> = value_indices
        .iter()
        .map(|idx| headers.get(*idx).unwrap_or_default().to_string())
        .collect();

    let mut by_key = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let Some(ts) = record.get(time_idx).and_then(parse_kpi_timestamp) else {
            continue;
        };
        let Some(key) = record.get(key_idx).map(str::trim).filter(|k| !k.is_empty()) else {
            continue;
        };

        let values: Vec<Option<f64>> = value_indices
            .iter()
            .map(|idx| {
                record
                    .get(*idx)
                    .and_then(|raw| raw.trim().parse::<f64>().ok())
            })
            .collect();
        by_key.insert((key.to_string(), ts), values);
    }

    Ok(Some(KpiTable {
        value_columns,
        by_key,
    }))
}

fn parse_kpi_timestamp(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(ms) = trimmed.parse::<i64>() {
        return Some(ms);
    }
    parse_utc_timestamp(trimmed)
}

fn schema_fingerprint(version: u32, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};columns:"));
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}

/// Writes the labeled feature table as CSV (tmp + rename so a partial write
/// never lands at the target path).
pub fn write_features_csv(path: &Path, table: &FeatureTable) -> Result<(), FeatureError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<String> = vec![
        "src_node".to_string(),
        "dst_node".to_string(),
        "window_start_ts_ms".to_string(),
        "window_end_ts_ms".to_string(),
    ];
    header.extend(table.schema.columns.iter().cloned());
    header.push("split".to_string());
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record: Vec<String> = vec![
            row.src_node.clone(),
            row.dst_node.clone(),
            row.window_start_ts_ms.to_string(),
            row.window_end_ts_ms.to_string(),
        ];
        for value in &row.values {
            record.push(value.map(|v| v.to_string()).unwrap_or_default());
        }
        record.push(
            row.split
                .map(|split| split.as_str().to_string())
                .unwrap_or_default(),
        );
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .expect("csv writer over Vec<u8> cannot fail to flush");
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Atomic byte write via tmp file + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp_path, bytes)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}
