// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Historian records and the on-disk batch layout.
//!
//! A batch is committed as one CSV file with one row per record:
//!
//! ```text
//! seq,timestamp,node_id,generation,value_type,value
//! 41,2023-11-14T22:13:20Z,ns=2;s=Line1.Speed,3,float64,25.5
//! ```
//!
//! The file name carries the batch sequence and the millisecond span of its
//! record timestamps, so readers can skip files without opening them:
//! `batch-{sequence:020}_{first_ms}_{last_ms}.csv`. While being written a
//! batch lives under `.batch-{sequence:020}.csv.tmp` in the same directory.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::error::{HistorianError, HistorianResult};
use vigil_core::types::{DataChangeEvent, Generation, NodeId, Value};

/// File name prefix of committed batches.
pub const BATCH_PREFIX: &str = "batch-";

/// File name extension of committed batches.
pub const BATCH_EXTENSION: &str = ".csv";

/// Suffix of batches still being written.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Column names of a batch file.
pub const CSV_HEADER: [&str; 6] = ["seq", "timestamp", "node_id", "generation", "value_type", "value"];

// =============================================================================
// HistorianRecord
// =============================================================================

/// One persisted data change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianRecord {
    /// Arrival sequence, unique and increasing across restarts.
    pub seq: u64,

    /// Node the value belongs to.
    pub node_id: NodeId,

    /// Recorded value.
    pub value: Value,

    /// Source timestamp.
    pub timestamp: DateTime<Utc>,

    /// Session generation the value was observed under.
    pub generation: Generation,
}

impl HistorianRecord {
    /// Creates a record from a data change event.
    pub fn from_event(seq: u64, event: &DataChangeEvent) -> Self {
        Self {
            seq,
            node_id: event.node_id.clone(),
            value: event.value.clone(),
            timestamp: event.source_timestamp,
            generation: event.generation,
        }
    }

    /// Returns `true` if the timestamp lies in `[start, end]`.
    #[inline]
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.timestamp >= start && self.timestamp <= end
    }
}

// =============================================================================
// HistorianBatch
// =============================================================================

/// A sealed group of records written as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorianBatch {
    /// Batch sequence, increasing across restarts.
    pub sequence: u64,

    /// Earliest record timestamp.
    pub first_timestamp: Option<DateTime<Utc>>,

    /// Latest record timestamp.
    pub last_timestamp: Option<DateTime<Utc>>,

    /// Records in arrival order.
    pub records: Vec<HistorianRecord>,
}

impl HistorianBatch {
    /// Seals `records` into a batch.
    pub fn new(sequence: u64, records: Vec<HistorianRecord>) -> Self {
        let mut batch = Self {
            sequence,
            first_timestamp: None,
            last_timestamp: None,
            records,
        };
        batch.refresh_bounds();
        batch
    }

    /// Number of records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the batch holds no records.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes up to `count` of the oldest records. Returns how many went.
    pub fn drop_oldest(&mut self, count: usize) -> usize {
        let count = count.min(self.records.len());
        self.records.drain(..count);
        self.refresh_bounds();
        count
    }

    /// Highest record sequence in the batch.
    pub fn max_record_seq(&self) -> Option<u64> {
        self.records.iter().map(|r| r.seq).max()
    }

    /// Name of the committed file.
    pub fn file_name(&self) -> BatchFileName {
        BatchFileName {
            sequence: self.sequence,
            span: self
                .first_timestamp
                .zip(self.last_timestamp)
                .map(|(first, last)| (floor_millis(first), ceil_millis(last))),
        }
    }

    /// Temporary file name for `sequence`.
    pub fn temp_file_name(sequence: u64) -> String {
        format!(".{}{:020}{}{}", BATCH_PREFIX, sequence, BATCH_EXTENSION, TEMP_SUFFIX)
    }

    /// Returns `true` for names of unfinished batch writes.
    pub fn is_temp_file_name(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX) && name.contains(BATCH_PREFIX)
    }

    fn refresh_bounds(&mut self) {
        self.first_timestamp = self.records.iter().map(|r| r.timestamp).min();
        self.last_timestamp = self.records.iter().map(|r| r.timestamp).max();
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encodes the records as CSV rows under [`CSV_HEADER`].
    pub fn to_csv(&self) -> HistorianResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| HistorianError::serialization(e.to_string()))?;
        for record in &self.records {
            writer
                .serialize(CsvRow::from(record))
                .map_err(|e| HistorianError::serialization(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| HistorianError::serialization(e.to_string()))
    }

    /// Decodes batch `sequence` read from `path`.
    pub fn from_csv(path: &Path, sequence: u64, bytes: &[u8]) -> HistorianResult<Self> {
        let mut reader = csv::Reader::from_reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| HistorianError::corrupted(path, e.to_string()))?;
        if !headers.is_empty() && headers.iter().ne(CSV_HEADER) {
            return Err(HistorianError::corrupted(
                path,
                format!("unexpected columns: {:?}", headers),
            ));
        }

        let mut records = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            let row = row.map_err(|e| HistorianError::corrupted(path, e.to_string()))?;
            records.push(
                row.into_record()
                    .map_err(|message| HistorianError::corrupted(path, message))?,
            );
        }
        Ok(Self::new(sequence, records))
    }
}

// =============================================================================
// BatchFileName
// =============================================================================

/// Parsed name of a committed batch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchFileName {
    /// Batch sequence.
    pub sequence: u64,

    /// Epoch milliseconds of the earliest (rounded down) and latest (rounded
    /// up) record. `None` for a batch without records.
    pub span: Option<(i64, i64)>,
}

impl BatchFileName {
    /// Parses a committed file name. Returns `None` for anything else.
    pub fn parse(name: &str) -> Option<Self> {
        let body = name.strip_prefix(BATCH_PREFIX)?.strip_suffix(BATCH_EXTENSION)?;
        let mut parts = body.split('_');
        let sequence = parts.next()?.parse().ok()?;
        let span = match (parts.next(), parts.next(), parts.next()) {
            (None, None, None) => None,
            (Some(first), Some(last), None) => Some((first.parse().ok()?, last.parse().ok()?)),
            _ => return None,
        };
        Some(Self { sequence, span })
    }

    /// Returns `false` only if no record of the file can lie in `[start, end]`.
    pub fn may_overlap(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.span {
            Some((first, last)) => first <= ceil_millis(end) && last >= floor_millis(start),
            None => false,
        }
    }

    /// Upper bound of the record timestamps in epoch milliseconds.
    pub fn newest_millis(&self) -> Option<i64> {
        self.span.map(|(_, last)| last)
    }
}

impl fmt::Display for BatchFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:020}", BATCH_PREFIX, self.sequence)?;
        if let Some((first, last)) = self.span {
            write!(f, "_{}_{}", first, last)?;
        }
        f.write_str(BATCH_EXTENSION)
    }
}

/// Epoch milliseconds, rounded down.
pub fn floor_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

/// Epoch milliseconds, rounded up.
pub fn ceil_millis(timestamp: DateTime<Utc>) -> i64 {
    let floor = timestamp.timestamp_millis();
    if timestamp.timestamp_subsec_nanos() % 1_000_000 == 0 {
        floor
    } else {
        floor + 1
    }
}

// =============================================================================
// CSV rows
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    seq: u64,
    timestamp: DateTime<Utc>,
    node_id: String,
    generation: Generation,
    value_type: String,
    value: String,
}

impl From<&HistorianRecord> for CsvRow {
    fn from(record: &HistorianRecord) -> Self {
        let value = match &record.value {
            Value::Null => String::new(),
            Value::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            other => other.to_string(),
        };
        Self {
            seq: record.seq,
            timestamp: record.timestamp,
            node_id: record.node_id.to_string(),
            generation: record.generation,
            value_type: record.value.type_name().to_string(),
            value,
        }
    }
}

impl CsvRow {
    fn into_record(self) -> Result<HistorianRecord, String> {
        let value = parse_value(&self.value_type, &self.value)
            .map_err(|e| format!("record {}: {}", self.seq, e))?;
        Ok(HistorianRecord {
            seq: self.seq,
            node_id: NodeId::new(self.node_id),
            value,
            timestamp: self.timestamp,
            generation: self.generation,
        })
    }
}

fn parse_value(value_type: &str, text: &str) -> Result<Value, String> {
    fn parse<T: std::str::FromStr>(text: &str, value_type: &str) -> Result<T, String> {
        text.parse()
            .map_err(|_| format!("'{}' is not a valid {}", text, value_type))
    }

    Ok(match value_type {
        "bool" => Value::Bool(parse(text, value_type)?),
        "int32" => Value::Int32(parse(text, value_type)?),
        "int64" => Value::Int64(parse(text, value_type)?),
        "uint32" => Value::UInt32(parse(text, value_type)?),
        "uint64" => Value::UInt64(parse(text, value_type)?),
        "float32" => Value::Float32(parse(text, value_type)?),
        "float64" => Value::Float64(parse(text, value_type)?),
        "string" => Value::String(text.to_string()),
        "datetime" => Value::DateTime(
            DateTime::parse_from_rfc3339(text)
                .map_err(|e| format!("'{}' is not a valid datetime: {}", text, e))?
                .with_timezone(&Utc),
        ),
        "null" => Value::Null,
        other => return Err(format!("unknown value type '{}'", other)),
    })
}
