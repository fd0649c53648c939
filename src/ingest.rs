//! Bulk raw transfer-event loading from local telemetry drops.
//!
//! Accepted file shapes under the raw directory:
//! - `.jsonl` — one event object per line, nested `energy_results`
//! - `.csv`   — header row, timestamp column resolved via alias candidates
//! - `.zip`   — archive containing any number of the above
//!
//! Malformed rows (missing required field, unparseable timestamp) are dropped
//! and counted, never fatal to the batch.

use std::collections::HashSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Column names tried, in order, when resolving the event start timestamp in
/// CSV inputs.
pub const TIMESTAMP_CANDIDATES: [&str; 6] = [
    "start_time",
    "timestamp",
    "time",
    "datetime",
    "date",
    "ts",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub exec_unit_id: Option<String>,
    pub src_node: String,
    pub dst_node: String,
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: i64,
    pub duration_s: f64,
    pub data_amount_mb: f64,
    pub bandwidth_req_mbps: f64,
    pub throughput_mbps: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub tx_wh: f64,
    pub rx_wh: f64,
    pub energy_wh: f64,
    pub effective_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub files_read: u64,
    pub events_parsed: u64,
    pub malformed_dropped: u64,
    pub duplicates_dropped: u64,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("raw directory not found: {0}")]
    RawDirMissing(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unsupported raw file extension: {0}")]
    UnsupportedExtension(PathBuf),
}

#[derive(Debug, Deserialize)]
struct EnergyResultsRecord {
    #[serde(rename = "total_tx_Wh", default)]
    total_tx_wh: Option<f64>,
    #[serde(rename = "total_rx_Wh", default)]
    total_rx_wh: Option<f64>,
    #[serde(rename = "total_energy_Wh", default)]
    total_energy_wh: Option<f64>,
    #[serde(rename = "MB", default)]
    effective_mb: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawEventRecord {
    #[serde(default)]
    exec_unit_id: Option<String>,
    #[serde(default)]
    src_node: Option<String>,
    #[serde(default)]
    dst_node: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    duration_s: Option<f64>,
    #[serde(default)]
    data_amount_mb: Option<f64>,
    #[serde(default)]
    bandwidth_req_mbps: Option<f64>,
    #[serde(default)]
    throughput_mbps: Option<f64>,
    #[serde(default)]
    jitter_ms: Option<f64>,
    #[serde(default)]
    packet_loss_percent: Option<f64>,
    #[serde(default)]
    energy_results: Option<EnergyResultsRecord>,
}

/// Reads every supported file under `raw_dir` (sorted by name for a
/// deterministic batch), drops malformed rows, and de-duplicates on
/// `exec_unit_id` keeping the first occurrence in time order.
pub fn load_raw_events(raw_dir: &Path) -> Result<(Vec<RawEvent>, IngestReport), IngestError> {
    if !raw_dir.is_dir() {
        return Err(IngestError::RawDirMissing(raw_dir.to_path_buf()));
    }

    info!(
        component = "ingest",
        event = "ingest.start",
        raw_dir = %raw_dir.display()
    );

    let mut report = IngestReport::default();
    let mut events = Vec::new();

    let mut paths: Vec<PathBuf> = fs::read_dir(raw_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && supported_extension(path).is_some())
        .collect();
    paths.sort();

    for path in paths {
        let bytes = fs::read(&path)?;
        let name = path.to_string_lossy().to_string();
        parse_raw_bytes(&name, &bytes, &mut events, &mut report)?;
        report.files_read += 1;
    }

    events.sort_by(|a, b| {
        (a.start_ts_ms_utc, &a.src_node, &a.dst_node, &a.exec_unit_id).cmp(&(
            b.start_ts_ms_utc,
            &b.src_node,
            &b.dst_node,
            &b.exec_unit_id,
        ))
    });

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut deduped = Vec::with_capacity(events.len());
    for event in events {
        if let Some(id) = &event.exec_unit_id {
            if !seen_ids.insert(id.clone()) {
                report.duplicates_dropped += 1;
                continue;
            }
        }
        deduped.push(event);
    }

    report.events_parsed = deduped.len() as u64;

    info!(
        component = "ingest",
        event = "ingest.finish",
        files_read = report.files_read,
        events_parsed = report.events_parsed,
        malformed_dropped = report.malformed_dropped,
        duplicates_dropped = report.duplicates_dropped
    );

    Ok((deduped, report))
}

/// Parses an ISO-8601 UTC timestamp into epoch milliseconds. Accepts RFC 3339
/// offsets and naive `T`/space-separated forms, which are taken as UTC.
pub fn parse_utc_timestamp(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

fn supported_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jsonl" => Some("jsonl"),
        "csv" => Some("csv"),
        "zip" => Some("zip"),
        _ => None,
    }
}

fn parse_raw_bytes(
    name: &str,
    bytes: &[u8],
    events: &mut Vec<RawEvent>,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with(".jsonl") {
        parse_jsonl(name, bytes, events, report);
        Ok(())
    } else if lowered.ends_with(".csv") {
        parse_csv(name, bytes, events, report)
    } else if lowered.ends_with(".zip") {
        parse_zip(name, bytes, events, report)
    } else {
        Err(IngestError::UnsupportedExtension(PathBuf::from(name)))
    }
}

fn parse_zip(
    name: &str,
    bytes: &[u8],
    events: &mut Vec<RawEvent>,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))?;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        let lowered = entry_name.to_ascii_lowercase();
        if !lowered.ends_with(".jsonl") && !lowered.ends_with(".csv") {
            continue;
        }

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        let qualified = format!("{name}:{entry_name}");
        parse_raw_bytes(&qualified, &buf, events, report)?;
    }
    Ok(())
}

fn parse_jsonl(name: &str, bytes: &[u8], events: &mut Vec<RawEvent>, report: &mut IngestReport) {
    let text = String::from_utf8_lossy(bytes);
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let record: RawEventRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                drop_malformed(name, line_no + 1, &err.to_string(), report);
                continue;
            }
        };

        match event_from_record(record) {
            Some(event) => events.push(event),
            None => drop_malformed(name, line_no + 1, "missing required field", report),
        }
    }
}

fn parse_csv(
    name: &str,
    bytes: &[u8],
    events: &mut Vec<RawEvent>,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(Cursor::new(bytes));

    let headers = reader.headers()?.clone();
    let find = |col: &str| headers.iter().position(|h| h == col);

    let start_idx = TIMESTAMP_CANDIDATES.iter().find_map(|cand| find(cand));
    let src_idx = find("src_node");
    let dst_idx = find("dst_node");
    let (Some(start_idx), Some(src_idx), Some(dst_idx)) = (start_idx, src_idx, dst_idx) else {
        warn!(
            component = "ingest",
            event = "ingest.file.unusable",
            file = name,
            reason = "missing src_node/dst_node/timestamp headers"
        );
        return Ok(());
    };

    let end_idx = find("end_time");
    let exec_idx = find("exec_unit_id");
    let duration_idx = find("duration_s");
    let numeric = |col: &str| find(col);
    let data_idx = numeric("data_amount_mb");
    let bw_idx = numeric("bandwidth_req_mbps");
    let tp_idx = numeric("throughput_mbps");
    let jitter_idx = numeric("jitter_ms");
    let loss_idx = numeric("packet_loss_percent");
    let tx_idx = numeric("tx_wh");
    let rx_idx = numeric("rx_wh");
    let energy_idx = numeric("energy_wh");
    let eff_idx = numeric("effective_mb");

    for (row_no, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                drop_malformed(name, row_no + 2, &err.to_string(), report);
                continue;
            }
        };

        let src = cell(&record, Some(src_idx));
        let dst = cell(&record, Some(dst_idx));
        let start = cell(&record, Some(start_idx)).and_then(|raw| parse_utc_timestamp(&raw));
        let duration = cell(&record, duration_idx).and_then(|raw| raw.parse::<f64>().ok());

        let (Some(src), Some(dst), Some(start_ts), Some(duration_s)) =
            (src, dst, start, duration)
        else {
            drop_malformed(name, row_no + 2, "missing required field", report);
            continue;
        };

        let end_ts = cell(&record, end_idx)
            .and_then(|raw| parse_utc_timestamp(&raw))
            .unwrap_or_else(|| start_ts + (duration_s * 1_000.0) as i64);

        events.push(RawEvent {
            exec_unit_id: cell(&record, exec_idx),
            src_node: src,
            dst_node: dst,
            start_ts_ms_utc: start_ts,
            end_ts_ms_utc: end_ts,
            duration_s,
            data_amount_mb: numeric_cell(&record, data_idx),
            bandwidth_req_mbps: numeric_cell(&record, bw_idx),
            throughput_mbps: numeric_cell(&record, tp_idx),
            jitter_ms: numeric_cell(&record, jitter_idx),
            packet_loss_percent: numeric_cell(&record, loss_idx),
            tx_wh: numeric_cell(&record, tx_idx),
            rx_wh: numeric_cell(&record, rx_idx),
            energy_wh: numeric_cell(&record, energy_idx),
            effective_mb: numeric_cell(&record, eff_idx),
        });
    }

    Ok(())
}

fn event_from_record(record: RawEventRecord) -> Option<RawEvent> {
    let src_node = non_empty(record.src_node)?;
    let dst_node = non_empty(record.dst_node)?;
    let start_ts = parse_utc_timestamp(&record.start_time?)?;
    let duration_s = record.duration_s?;
    let end_ts = record
        .end_time
        .as_deref()
        .and_then(parse_utc_timestamp)
        .unwrap_or_else(|| start_ts + (duration_s * 1_000.0) as i64);

    let energy = record.energy_results;
    let energy_field = |f: fn(&EnergyResultsRecord) -> Option<f64>| {
        energy.as_ref().and_then(f).unwrap_or(0.0)
    };

    Some(RawEvent {
        exec_unit_id: non_empty(record.exec_unit_id),
        src_node,
        dst_node,
        start_ts_ms_utc: start_ts,
        end_ts_ms_utc: end_ts,
        duration_s,
        data_amount_mb: record.data_amount_mb.unwrap_or(0.0),
        bandwidth_req_mbps: record.bandwidth_req_mbps.unwrap_or(0.0),
        throughput_mbps: record.throughput_mbps.unwrap_or(0.0),
        jitter_ms: record.jitter_ms.unwrap_or(0.0),
        packet_loss_percent: record.packet_loss_percent.unwrap_or(0.0),
        tx_wh: energy_field(|e| e.total_tx_wh),
        rx_wh: energy_field(|e| e.total_rx_wh),
        energy_wh: energy_field(|e| e.total_energy_wh),
        effective_mb: energy_field(|e| e.effective_mb),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn cell(record: &StringRecord, idx: Option<usize>) -> Option<String> {
    let idx = idx?;
    let raw = record.get(idx)?.trim();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn numeric_cell(record: &StringRecord, idx: Option<usize>) -> f64 {
    cell(record, idx)
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn drop_malformed(file: &str, line: usize, reason: &str, report: &mut IngestReport) {
    report.malformed_dropped += 1;
    debug!(
        component = "ingest",
        event = "ingest.row.dropped",
        file,
        line,
        reason
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_and_naive_timestamps_parse_to_utc_millis() {
        let expected = 1_735_689_600_000;
        assert_eq!(parse_utc_timestamp("2025-01-01T00:00:00Z"), Some(expected));
        assert_eq!(
            parse_utc_timestamp("2025-01-01T01:00:00+01:00"),
            Some(expected)
        );
        assert_eq!(parse_utc_timestamp("2025-01-01 00:00:00"), Some(expected));
        assert_eq!(parse_utc_timestamp("not-a-time"), None);
    }

    #[test]
    fn jsonl_rows_missing_required_fields_are_dropped_not_fatal() {
        let lines = concat!(
            "{\"src_node\":\"edge-1\",\"dst_node\":\"cloud-1\",\"start_time\":\"2025-01-01T00:00:00Z\",\"duration_s\":2.0}\n",
            "{\"dst_node\":\"cloud-1\",\"start_time\":\"2025-01-01T00:00:00Z\",\"duration_s\":2.0}\n",
            "{\"src_node\":\"edge-1\",\"dst_node\":\"cloud-1\",\"start_time\":\"garbage\",\"duration_s\":2.0}\n",
            "not json at all\n",
        );

        let mut events = Vec::new();
        let mut report = IngestReport::default();
        parse_jsonl("events.jsonl", lines.as_bytes(), &mut events, &mut report);

        assert_eq!(events.len(), 1);
        assert_eq!(report.malformed_dropped, 3);
        assert_eq!(events[0].src_node, "edge-1");
        assert_eq!(events[0].end_ts_ms_utc, events[0].start_ts_ms_utc + 2_000);
    }

    #[test]
    fn nested_energy_results_flatten_onto_the_event() {
        let line = "{\"exec_unit_id\":\"u-1\",\"src_node\":\"a\",\"dst_node\":\"b\",\
                    \"start_time\":\"2025-01-01T00:00:00Z\",\"duration_s\":1.5,\
                    \"energy_results\":{\"total_tx_Wh\":0.4,\"total_rx_Wh\":0.2,\
                    \"total_energy_Wh\":0.6,\"MB\":128.0}}\n";

        let mut events = Vec::new();
        let mut report = IngestReport::default();
        parse_jsonl("events.jsonl", line.as_bytes(), &mut events, &mut report);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.tx_wh, 0.4);
        assert_eq!(event.rx_wh, 0.2);
        assert_eq!(event.energy_wh, 0.6);
        assert_eq!(event.effective_mb, 128.0);
    }

    #[test]
    fn csv_timestamp_column_resolves_through_alias_candidates() {
        let csv = "exec_unit_id,src_node,dst_node,timestamp,duration_s,throughput_mbps\n\
                   u-1,a,b,2025-01-01T00:00:00Z,3.0,95.5\n\
                   u-2,a,,2025-01-01T00:05:00Z,3.0,90.0\n";

        let mut events = Vec::new();
        let mut report = IngestReport::default();
        parse_csv("events.csv", csv.as_bytes(), &mut events, &mut report)
            .expect("csv parse should not fail the batch");

        assert_eq!(events.len(), 1);
        assert_eq!(report.malformed_dropped, 1);
        assert_eq!(events[0].throughput_mbps, 95.5);
    }
}
