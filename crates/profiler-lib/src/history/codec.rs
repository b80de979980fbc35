//! Flat text format shared by export, import and the append-only log
//!
//! A header line of field names followed by one comma-joined row per
//! record. Values use their natural string form with no escaping; process
//! names and labels never contain the delimiter.

use crate::models::{HistoryRecord, MemoryUtilization, ProcessIdentity, ProcessKind};
use thiserror::Error;
use tracing::debug;

pub const DELIMITER: char = ',';

/// Field names, in row order
pub const FIELDS: [&str; 15] = [
    "timestamp_seconds",
    "pid",
    "process_name",
    "process_label",
    "cpu_percent",
    "gpu_percent",
    "system_total_memory_mb",
    "system_free_memory_mb",
    "uss_mb",
    "rss_mb",
    "vms_mb",
    "wset_mb",
    "pwset_mb",
    "taskmgr_mb",
    "vsize_mb",
];

/// Header line, without the trailing newline
pub fn header() -> String {
    FIELDS.join(",")
}

/// Why a row could not be decoded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Encode one record as a row, without the trailing newline
pub fn encode_row(record: &HistoryRecord) -> String {
    let memory = &record.memory;
    let fields: [String; 15] = [
        record.timestamp.to_string(),
        record.process.kind.to_string(),
        record.process.target_name.clone(),
        record.process.label.clone().unwrap_or_default(),
        record.cpu_percent.to_string(),
        record.gpu_percent.to_string(),
        memory.system_total_mb.to_string(),
        memory.system_free_mb.to_string(),
        memory.uss_mb.to_string(),
        memory.rss_mb.to_string(),
        memory.vms_mb.to_string(),
        memory.wset_mb.to_string(),
        memory.pwset_mb.to_string(),
        memory.external_mb.to_string(),
        memory.virtual_size_mb.to_string(),
    ];
    fields.join(",")
}

/// Encode records as a complete document, header first
pub fn encode<'a>(records: impl IntoIterator<Item = &'a HistoryRecord>) -> String {
    let mut out = header();
    out.push('\n');
    for record in records {
        out.push_str(&encode_row(record));
        out.push('\n');
    }
    out
}

fn float(field: &'static str, value: &str) -> Result<f64, RowError> {
    value.trim().parse().map_err(|_| RowError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Decode one row
pub fn decode_row(line: &str) -> Result<HistoryRecord, RowError> {
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    if fields.len() != FIELDS.len() {
        return Err(RowError::FieldCount {
            expected: FIELDS.len(),
            found: fields.len(),
        });
    }

    let timestamp = fields[0]
        .trim()
        .parse::<i64>()
        .map_err(|_| RowError::InvalidField {
            field: FIELDS[0],
            value: fields[0].to_string(),
        })?;
    let kind = fields[1]
        .trim()
        .parse::<ProcessKind>()
        .map_err(|_| RowError::InvalidField {
            field: FIELDS[1],
            value: fields[1].to_string(),
        })?;
    let label = match fields[3] {
        "" => None,
        label => Some(label.to_string()),
    };

    Ok(HistoryRecord {
        timestamp,
        process: ProcessIdentity {
            kind,
            target_name: fields[2].to_string(),
            label,
        },
        cpu_percent: float(FIELDS[4], fields[4])?,
        gpu_percent: float(FIELDS[5], fields[5])?,
        memory: MemoryUtilization {
            system_total_mb: float(FIELDS[6], fields[6])?,
            system_free_mb: float(FIELDS[7], fields[7])?,
            uss_mb: float(FIELDS[8], fields[8])?,
            rss_mb: float(FIELDS[9], fields[9])?,
            vms_mb: float(FIELDS[10], fields[10])?,
            wset_mb: float(FIELDS[11], fields[11])?,
            pwset_mb: float(FIELDS[12], fields[12])?,
            external_mb: float(FIELDS[13], fields[13])?,
            virtual_size_mb: float(FIELDS[14], fields[14])?,
        },
    })
}

/// Records decoded from a document plus the count of rows dropped
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub records: Vec<HistoryRecord>,
    pub skipped: usize,
}

/// Decode a document, skipping header lines, blank lines and corrupt rows
pub fn decode(text: &str) -> Decoded {
    let header = header();
    let mut decoded = Decoded::default();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line == header {
            continue;
        }
        match decode_row(line) {
            Ok(record) => decoded.records.push(record),
            Err(e) => {
                debug!(line = number + 1, error = %e, "Skipping corrupt history row");
                decoded.skipped += 1;
            }
        }
    }

    decoded
}
