//! Fixed-window aggregation of raw transfer events per link.
//!
//! Windows are half-open `[start, start + cadence)` buckets keyed by the
//! event start timestamp. A window row exists only when at least one event
//! fell inside it. Aggregation sorts before grouping, so re-running on the
//! same input in any order produces identical rows.

use std::path::Path;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ingest::RawEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Window cadence in seconds.
    pub window_secs: u32,
    /// Acceptable rank error for percentile estimates. The built-in
    /// estimator is sort-based nearest-rank and exact, so 0.0 holds; a
    /// sketch-based replacement must not exceed this bound.
    pub percentile_max_rank_error: f64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            percentile_max_rank_error: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRow {
    pub src_node: String,
    pub dst_node: String,
    pub window_start_ts_ms: i64,
    pub window_end_ts_ms: i64,
    pub n_events: u64,
    pub sum_data_amount_mb: f64,
    pub sum_effective_mb: f64,
    pub sum_duration_s: f64,
    pub sum_energy_wh: f64,
    pub sum_tx_wh: f64,
    pub sum_rx_wh: f64,
    pub avg_bandwidth_req_mbps: f64,
    pub avg_throughput_mbps: f64,
    pub avg_jitter_ms: f64,
    pub avg_packet_loss_percent: f64,
    pub p50_throughput_mbps: f64,
    pub p95_packet_loss_percent: f64,
    pub energy_wh_per_effective_mb: Option<f64>,
    pub energy_wh_per_s: Option<f64>,
    pub throughput_efficiency_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub input_events: u64,
    pub dropped_self_links: u64,
    pub dropped_nonpositive_duration: u64,
    pub output_windows: u64,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("invalid aggregate config: {0}")]
    InvalidConfig(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub fn validate_aggregate_config(cfg: &AggregateConfig) -> Result<(), AggregateError> {
    if cfg.window_secs == 0 {
        return Err(AggregateError::InvalidConfig(
            "window_secs must be > 0".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&cfg.percentile_max_rank_error) {
        return Err(AggregateError::InvalidConfig(format!(
            "percentile_max_rank_error must be in [0, 1), got {}",
            cfg.percentile_max_rank_error
        )));
    }
    Ok(())
}

/// Aggregates events into per-link window rows. Events with `src == dst` or
/// a non-positive duration are dropped as malformed.
pub fn aggregate_events(
    events: &[RawEvent],
    cfg: &AggregateConfig,
) -> Result<(Vec<WindowRow>, AggregateReport), AggregateError> {
    validate_aggregate_config(cfg)?;

    let mut report = AggregateReport {
        input_events: events.len() as u64,
        ..AggregateReport::default()
    };

    let window_ms = cfg.window_secs as i64 * 1_000;
    let mut kept: Vec<&RawEvent> = Vec::with_capacity(events.len());
    for event in events {
        if event.src_node == event.dst_node {
            report.dropped_self_links += 1;
            continue;
        }
        if event.duration_s <= 0.0 {
            report.dropped_nonpositive_duration += 1;
            continue;
        }
        kept.push(event);
    }

    kept.sort_by(|a, b| {
        let ka = (
            &a.src_node,
            &a.dst_node,
            window_start(a.start_ts_ms_utc, window_ms),
            a.start_ts_ms_utc,
            &a.exec_unit_id,
        );
        let kb = (
            &b.src_node,
            &b.dst_node,
            window_start(b.start_ts_ms_utc, window_ms),
            b.start_ts_ms_utc,
            &b.exec_unit_id,
        );
        ka.cmp(&kb)
    });

    let mut rows = Vec::new();
    let mut bucket: Vec<&RawEvent> = Vec::new();
    for event in kept {
        let same_bucket = bucket.first().map(|head| {
            head.src_node == event.src_node
                && head.dst_node == event.dst_node
                && window_start(head.start_ts_ms_utc, window_ms)
                    == window_start(event.start_ts_ms_utc, window_ms)
        });
        match same_bucket {
            Some(true) | None => bucket.push(event),
            Some(false) => {
                rows.push(reduce_bucket(&bucket, window_ms));
                bucket.clear();
                bucket.push(event);
            }
        }
    }
    if !bucket.is_empty() {
        rows.push(reduce_bucket(&bucket, window_ms));
    }

    report.output_windows = rows.len() as u64;

    info!(
        component = "aggregate",
        event = "aggregate.finish",
        input_events = report.input_events,
        dropped_self_links = report.dropped_self_links,
        dropped_nonpositive_duration = report.dropped_nonpositive_duration,
        output_windows = report.output_windows
    );

    Ok((rows, report))
}

/// Deterministic nearest-rank percentile over ascending-sorted values.
/// `p` in [0, 1]; rank error bound is zero.
pub fn nearest_rank_percentile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    let rank = (p * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

fn window_start(ts_ms: i64, window_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(window_ms)
}

fn reduce_bucket(bucket: &[&RawEvent], window_ms: i64) -> WindowRow {
    let head = bucket[0];
    let start = window_start(head.start_ts_ms_utc, window_ms);
    let n = bucket.len() as f64;

    let sum = |f: fn(&RawEvent) -> f64| bucket.iter().map(|e| f(e)).sum::<f64>();
    let avg = |f: fn(&RawEvent) -> f64| sum(f) / n;
    let sorted = |f: fn(&RawEvent) -> f64| {
        let mut values: Vec<f64> = bucket.iter().map(|e| f(e)).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values
    };

    let sum_effective_mb = sum(|e| e.effective_mb);
    let sum_duration_s = sum(|e| e.duration_s);
    let sum_energy_wh = sum(|e| e.energy_wh);
    let avg_bandwidth_req_mbps = avg(|e| e.bandwidth_req_mbps);
    let avg_throughput_mbps = avg(|e| e.throughput_mbps);

    let ratio = |num: f64, denom: f64| if denom > 0.0 { Some(num / denom) } else { None };

    WindowRow {
        src_node: head.src_node.clone(),
        dst_node: head.dst_node.clone(),
        window_start_ts_ms: start,
        window_end_ts_ms: start + window_ms,
        n_events: bucket.len() as u64,
        sum_data_amount_mb: sum(|e| e.data_amount_mb),
        sum_effective_mb,
        sum_duration_s,
        sum_energy_wh,
        sum_tx_wh: sum(|e| e.tx_wh),
        sum_rx_wh: sum(|e| e.rx_wh),
        avg_bandwidth_req_mbps,
        avg_throughput_mbps,
        avg_jitter_ms: avg(|e| e.jitter_ms),
        avg_packet_loss_percent: avg(|e| e.packet_loss_percent),
        p50_throughput_mbps: nearest_rank_percentile(&sorted(|e| e.throughput_mbps), 0.5),
        p95_packet_loss_percent: nearest_rank_percentile(&sorted(|e| e.packet_loss_percent), 0.95),
        energy_wh_per_effective_mb: ratio(sum_energy_wh, sum_effective_mb),
        energy_wh_per_s: ratio(sum_energy_wh, sum_duration_s),
        throughput_efficiency_ratio: ratio(avg_throughput_mbps, avg_bandwidth_req_mbps),
    }
}

pub fn open_store(path: &Path) -> Result<Connection, AggregateError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS link_windows (
            src_node TEXT NOT NULL,
            dst_node TEXT NOT NULL,
            window_start_ts_ms INTEGER NOT NULL,
            window_end_ts_ms INTEGER NOT NULL,
            n_events INTEGER NOT NULL,
            sum_data_amount_mb REAL NOT NULL,
            sum_effective_mb REAL NOT NULL,
            sum_duration_s REAL NOT NULL,
            sum_energy_wh REAL NOT NULL,
            sum_tx_wh REAL NOT NULL,
            sum_rx_wh REAL NOT NULL,
            avg_bandwidth_req_mbps REAL NOT NULL,
            avg_throughput_mbps REAL NOT NULL,
            avg_jitter_ms REAL NOT NULL,
            avg_packet_loss_percent REAL NOT NULL,
            p50_throughput_mbps REAL NOT NULL,
            p95_packet_loss_percent REAL NOT NULL,
            energy_wh_per_effective_mb REAL,
            energy_wh_per_s REAL,
            throughput_efficiency_ratio REAL,
            PRIMARY KEY(src_node, dst_node, window_start_ts_ms)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(conn)
}

/// Upserts window rows keyed by (src, dst, window start); re-running the
/// same batch leaves the store unchanged.
pub fn write_windows(conn: &mut Connection, rows: &[WindowRow]) -> Result<(), AggregateError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "
            INSERT OR REPLACE INTO link_windows (
                src_node, dst_node, window_start_ts_ms, window_end_ts_ms, n_events,
                sum_data_amount_mb, sum_effective_mb, sum_duration_s, sum_energy_wh,
                sum_tx_wh, sum_rx_wh, avg_bandwidth_req_mbps, avg_throughput_mbps,
                avg_jitter_ms, avg_packet_loss_percent, p50_throughput_mbps,
                p95_packet_loss_percent, energy_wh_per_effective_mb, energy_wh_per_s,
                throughput_efficiency_ratio
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20)
            ",
        )?;
        for row in rows {
            stmt.execute(params![
                row.src_node,
                row.dst_node,
                row.window_start_ts_ms,
                row.window_end_ts_ms,
                row.n_events,
                row.sum_data_amount_mb,
                row.sum_effective_mb,
                row.sum_duration_s,
                row.sum_energy_wh,
                row.sum_tx_wh,
                row.sum_rx_wh,
                row.avg_bandwidth_req_mbps,
                row.avg_throughput_mbps,
                row.avg_jitter_ms,
                row.avg_packet_loss_percent,
                row.p50_throughput_mbps,
                row.p95_packet_loss_percent,
                row.energy_wh_per_effective_mb,
                row.energy_wh_per_s,
                row.throughput_efficiency_ratio,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Reads all window rows sorted by (src, dst, window start) — the order the
/// feature stage requires.
pub fn read_windows_sorted(conn: &Connection) -> Result<Vec<WindowRow>, AggregateError> {
    let mut stmt = conn.prepare(
        "
        SELECT
            src_node, dst_node, window_start_ts_ms, window_end_ts_ms, n_events,
            sum_data_amount_mb, sum_effective_mb, sum_duration_s, sum_energy_wh,
            sum_tx_wh, sum_rx_wh, avg_bandwidth_req_mbps, avg_throughput_mbps,
            avg_jitter_ms, avg_packet_loss_percent, p50_throughput_mbps,
            p95_packet_loss_percent, energy_wh_per_effective_mb, energy_wh_per_s,
            throughput_efficiency_ratio
        FROM link_windows
        ORDER BY src_node ASC, dst_node ASC, window_start_ts_ms ASC
        ",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(WindowRow {
                src_node: row.get(0)?,
                dst_node: row.get(1)?,
                window_start_ts_ms: row.get(2)?,
                window_end_ts_ms: row.get(3)?,
                n_events: row.get(4)?,
                sum_data_amount_mb: row.get(5)?,
                sum_effective_mb: row.get(6)?,
                sum_duration_s: row.get(7)?,
                sum_energy_wh: row.get(8)?,
                sum_tx_wh: row.get(9)?,
                sum_rx_wh: row.get(10)?,
                avg_bandwidth_req_mbps: row.get(11)?,
                avg_throughput_mbps: row.get(12)?,
                avg_jitter_ms: row.get(13)?,
                avg_packet_loss_percent: row.get(14)?,
                p50_throughput_mbps: row.get(15)?,
                p95_packet_loss_percent: row.get(16)?,
                energy_wh_per_effective_mb: row.get(17)?,
                energy_wh_per_s: row.get(18)?,
                throughput_efficiency_ratio: row.get(19)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_hits_exact_elements() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(nearest_rank_percentile(&values, 0.5), 2.0);
        assert_eq!(nearest_rank_percentile(&values, 0.95), 4.0);
        assert_eq!(nearest_rank_percentile(&values, 0.0), 1.0);
        assert_eq!(nearest_rank_percentile(&values, 1.0), 4.0);
    }

    #[test]
    fn window_start_floors_to_cadence_including_negative_timestamps() {
        assert_eq!(window_start(0, 300_000), 0);
        assert_eq!(window_start(299_999, 300_000), 0);
        assert_eq!(window_start(300_000, 300_000), 300_000);
        assert_eq!(window_start(-1, 300_000), -300_000);
    }

    #[test]
    fn config_rejects_zero_cadence_and_out_of_range_rank_error() {
        let cfg = AggregateConfig {
            window_secs: 0,
            ..AggregateConfig::default()
        };
        assert!(matches!(
            validate_aggregate_config(&cfg),
            Err(AggregateError::InvalidConfig(_))
        ));

        let cfg = AggregateConfig {
            percentile_max_rank_error: 1.0,
            ..AggregateConfig::default()
        };
        assert!(matches!(
            validate_aggregate_config(&cfg),
            Err(AggregateError::InvalidConfig(_))
        ));
    }
}
