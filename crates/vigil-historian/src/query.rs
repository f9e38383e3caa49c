// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Trend queries over committed batches and not yet flushed records.
//!
//! Results are ordered by source timestamp; equal timestamps keep arrival
//! order. Windows are inclusive at both ends. Buckets are half-open
//! `[bucket_start, bucket_start + width)` and aligned to the window start;
//! buckets without usable samples are omitted.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::error::{HistorianError, HistorianResult, QueryError, QueryResult};
use vigil_core::types::{NodeId, Value};

use crate::batch::HistorianRecord;
use crate::buffer::HistorianBuffer;
use crate::store::BatchStore;

// =============================================================================
// Result types
// =============================================================================

/// One historical sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Source timestamp.
    pub timestamp: DateTime<Utc>,
    /// Recorded value.
    pub value: Value,
}

impl From<HistorianRecord> for TrendPoint {
    fn from(record: HistorianRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            value: record.value,
        }
    }
}

/// One aggregated bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPoint {
    /// Inclusive bucket start.
    pub bucket_start: DateTime<Utc>,
    /// Aggregated value.
    pub value: Value,
    /// Samples that contributed.
    pub samples: usize,
}

/// Bucket aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    /// Latest sample of any type.
    Last,
    /// Arithmetic mean of numeric samples.
    #[default]
    Average,
    /// Smallest numeric sample.
    Min,
    /// Largest numeric sample.
    Max,
}

impl Aggregator {
    /// Returns the aggregator name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Average => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "last" => Ok(Self::Last),
            "avg" | "average" | "mean" => Ok(Self::Average),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(QueryError::invalid_bucket(format!(
                "unknown aggregator '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// TrendQueryEngine
// =============================================================================

/// Read side of the historian.
///
/// With a buffer attached, records accepted but not yet committed are
/// included, so every acknowledged point is visible.
#[derive(Clone)]
pub struct TrendQueryEngine {
    store: BatchStore,
    buffer: Option<HistorianBuffer>,
}

impl TrendQueryEngine {
    /// Creates an engine over committed batches only.
    pub fn new(store: BatchStore) -> Self {
        Self {
            store,
            buffer: None,
        }
    }

    /// Includes the pending records of `buffer`.
    pub fn with_buffer(mut self, buffer: HistorianBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Samples of `node_id` with timestamps in `[start, end]`.
    pub async fn query(
        &self,
        node_id: &NodeId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> QueryResult<Vec<TrendPoint>> {
        check_range(start, end)?;
        let records = self.collect(node_id, Some((start, end))).await?;
        Ok(records.into_iter().map(TrendPoint::from).collect())
    }

    /// Samples of `node_id` in `[start, end]` aggregated into buckets of
    /// `width`.
    pub async fn query_bucketed(
        &self,
        node_id: &NodeId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        width: Duration,
        aggregator: Aggregator,
    ) -> QueryResult<Vec<BucketPoint>> {
        check_range(start, end)?;
        let width_ms = bucket_width_ms(width)?;
        let records = self.collect(node_id, Some((start, end))).await?;
        Ok(aggregate(&records, start, width_ms, aggregator))
    }

    /// The `n` most recent samples of `node_id`, oldest first.
    pub async fn query_last_n(&self, node_id: &NodeId, n: usize) -> QueryResult<Vec<TrendPoint>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let pending = self.pending_records();
        let store = self.store.clone();
        let node = node_id.clone();
        let committed = run_blocking(move || store.scan_latest(&node, n)).await?;

        let records = merge(node_id, None, committed, pending);
        let skip = records.len().saturating_sub(n);
        Ok(records.into_iter().skip(skip).map(TrendPoint::from).collect())
    }

    /// Committed and pending records, deduplicated and ordered by
    /// `(timestamp, arrival)`.
    async fn collect(
        &self,
        node_id: &NodeId,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> QueryResult<Vec<HistorianRecord>> {
        let pending = self.pending_records();
        let store = self.store.clone();
        let node = node_id.clone();
        let committed = run_blocking(move || store.scan(&node, window)).await?;
        Ok(merge(node_id, window, committed, pending))
    }

    // Taken before the files are listed: a batch committed in between shows
    // up in both and is deduplicated by `merge`.
    fn pending_records(&self) -> Vec<HistorianRecord> {
        self.buffer
            .as_ref()
            .map(HistorianBuffer::pending_records)
            .unwrap_or_default()
    }
}

async fn run_blocking<F>(scan: F) -> QueryResult<Vec<HistorianRecord>>
where
    F: FnOnce() -> HistorianResult<Vec<HistorianRecord>> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(scan)
        .await
        .map_err(|e| HistorianError::read(format!("query task failed: {}", e)))??)
}

fn merge(
    node_id: &NodeId,
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    mut records: Vec<HistorianRecord>,
    pending: Vec<HistorianRecord>,
) -> Vec<HistorianRecord> {
    let mut seen: HashSet<u64> = records.iter().map(|r| r.seq).collect();
    records.extend(pending.into_iter().filter(|record| {
        &record.node_id == node_id
            && window.map_or(true, |(start, end)| record.within(start, end))
            && seen.insert(record.seq)
    }));

    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
    records
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> QueryResult<()> {
    if start > end {
        return Err(QueryError::invalid_range(start.to_rfc3339(), end.to_rfc3339()));
    }
    Ok(())
}

fn bucket_width_ms(width: Duration) -> QueryResult<i64> {
    let millis = i64::try_from(width.as_millis())
        .map_err(|_| QueryError::invalid_bucket("bucket width is too large"))?;
    if millis <= 0 {
        return Err(QueryError::invalid_bucket(
            "bucket width must be at least one millisecond",
        ));
    }
    Ok(millis)
}

// =============================================================================
// Aggregation
// =============================================================================

#[derive(Default)]
struct Accumulator {
    samples: usize,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    last: Option<Value>,
}

impl Accumulator {
    fn add(&mut self, value: &Value) {
        self.last = Some(value.clone());
        if let Some(v) = value.as_f64().filter(|v| !v.is_nan()) {
            self.samples += 1;
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn finish(self, aggregator: Aggregator, total: usize) -> Option<(Value, usize)> {
        match aggregator {
            Aggregator::Last => self.last.map(|value| (value, total)),
            Aggregator::Average if self.samples > 0 => {
                Some((Value::Float64(self.sum / self.samples as f64), self.samples))
            }
            Aggregator::Min => self.min.map(|v| (Value::Float64(v), self.samples)),
            Aggregator::Max => self.max.map(|v| (Value::Float64(v), self.samples)),
            Aggregator::Average => None,
        }
    }
}

/// Aggregates records sorted by `(timestamp, arrival)` into buckets of
/// `width_ms` starting at `start`. Records before `start` are ignored.
pub fn aggregate(
    records: &[HistorianRecord],
    start: DateTime<Utc>,
    width_ms: i64,
    aggregator: Aggregator,
) -> Vec<BucketPoint> {
    let mut buckets: BTreeMap<i64, (Accumulator, usize)> = BTreeMap::new();

    for record in records {
        let offset = record
            .timestamp
            .signed_duration_since(start)
            .num_milliseconds();
        if offset < 0 {
            continue;
        }
        let (accumulator, total) = buckets.entry(offset / width_ms).or_default();
        accumulator.add(&record.value);
        *total += 1;
    }

    buckets
        .into_iter()
        .filter_map(|(index, (accumulator, total))| {
            let (value, samples) = accumulator.finish(aggregator, total)?;
            Some(BucketPoint {
                bucket_start: start + chrono::Duration::milliseconds(index * width_ms),
                value,
                samples,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HistorianConfig;
    use crate::sink::FileBatchSink;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;
    use vigil_core::types::DataChangeEvent;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn record(seq: u64, seconds: i64, value: impl Into<Value>) -> HistorianRecord {
        HistorianRecord {
            seq,
            node_id: NodeId::new("n1"),
            value: value.into(),
            timestamp: at(seconds),
            generation: 1,
        }
    }

    fn setup(dir: &TempDir) -> (HistorianBuffer, TrendQueryEngine) {
        let sink = FileBatchSink::open(dir.path()).unwrap();
        let store = sink.store().clone();
        let config = HistorianConfig::for_testing()
            .with_data_dir(dir.path())
            .with_max_batch_events(100)
            .with_max_buffered_events(1000);
        let buffer = HistorianBuffer::new(config, Arc::new(sink)).unwrap();
        let engine = TrendQueryEngine::new(store).with_buffer(buffer.clone());
        (buffer, engine)
    }

    #[test]
    fn test_aggregate_average_half_open_buckets() {
        let records = vec![
            record(1, 0, 10.0f64),
            record(2, 3, 20.0f64),
            record(3, 6, 30.0f64),
            record(4, 9, 40.0f64),
        ];
        let buckets = aggregate(&records, at(0), 5_000, Aggregator::Average);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, at(0));
        assert_eq!(buckets[0].value, Value::Float64(15.0));
        assert_eq!(buckets[1].bucket_start, at(5));
        assert_eq!(buckets[1].value, Value::Float64(35.0));

        // A sample exactly on a boundary belongs to the later bucket.
        let boundary = vec![record(1, 4, 1.0f64), record(2, 5, 2.0f64)];
        let buckets = aggregate(&boundary, at(0), 5_000, Aggregator::Average);
        assert_eq!(buckets[1].bucket_start, at(5));
        assert_eq!(buckets[1].samples, 1);
    }

    #[test]
    fn test_aggregate_min_max_last() {
        let records = vec![
            record(1, 0, 7i32),
            record(2, 1, Value::String("fault".into())),
            record(3, 2, 3i32),
            record(4, 20, 5i32),
        ];

        let min = aggregate(&records, at(0), 5_000, Aggregator::Min);
        assert_eq!(min[0].value, Value::Float64(3.0));
        assert_eq!(min[0].samples, 2);

        let max = aggregate(&records, at(0), 5_000, Aggregator::Max);
        assert_eq!(max[0].value, Value::Float64(7.0));

        let last = aggregate(&records, at(0), 5_000, Aggregator::Last);
        assert_eq!(last[0].value, Value::Int32(3));
        assert_eq!(last[0].samples, 3);

        // Empty buckets between 5s and 20s are omitted.
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].bucket_start, at(20));
    }

    #[test]
    fn test_aggregate_skips_non_numeric_buckets() {
        let records = vec![record(1, 0, Value::String("idle".into())), record(2, 6, 1.0f64)];
        let buckets = aggregate(&records, at(0), 5_000, Aggregator::Average);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bucket_start, at(5));
    }

    #[test]
    fn test_aggregator_parse() {
        assert_eq!("avg".parse::<Aggregator>().unwrap(), Aggregator::Average);
        assert_eq!("MAX".parse::<Aggregator>().unwrap(), Aggregator::Max);
        assert!("median".parse::<Aggregator>().is_err());
        assert_eq!(Aggregator::default(), Aggregator::Average);
    }

    #[tokio::test]
    async fn test_query_merges_pending_and_committed() {
        let dir = TempDir::new().unwrap();
        let (buffer, engine) = setup(&dir);
        let node = NodeId::new("n1");

        buffer.ingest(&DataChangeEvent::new("n1", 1.0f64, at(1), 1)).unwrap();
        buffer.ingest(&DataChangeEvent::new("other", 9.0f64, at(1), 1)).unwrap();
        buffer.flush_now().await.unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 2.0f64, at(2), 1)).unwrap();

        let points = engine.query(&node, at(0), at(10)).await.unwrap();
        assert_eq!(
            points.iter().map(|p| p.value.clone()).collect::<Vec<_>>(),
            vec![Value::Float64(1.0), Value::Float64(2.0)]
        );

        let window = engine.query(&node, at(2), at(2)).await.unwrap();
        assert_eq!(window.len(), 1);
        assert!(engine.query(&node, at(50), at(60)).await.unwrap().is_empty());

        buffer.flush_now().await.unwrap();
        assert_eq!(engine.query(&node, at(0), at(10)).await.unwrap().len(), 2);
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_last_n_keeps_arrival_order_on_ties() {
        let dir = TempDir::new().unwrap();
        let (buffer, engine) = setup(&dir);
        let node = NodeId::new("n1");

        for value in 0i32..3 {
            buffer
                .ingest(&DataChangeEvent::new("n1", value, at(5), 1))
                .unwrap();
        }
        buffer.flush_now().await.unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 3i32, at(5), 2)).unwrap();

        let last = engine.query_last_n(&node, 2).await.unwrap();
        assert_eq!(
            last.iter().map(|p| p.value.clone()).collect::<Vec<_>>(),
            vec![Value::Int32(2), Value::Int32(3)]
        );
        assert_eq!(engine.query_last_n(&node, 10).await.unwrap().len(), 4);
        assert!(engine.query_last_n(&node, 0).await.unwrap().is_empty());
        assert!(engine
            .query_last_n(&NodeId::new("missing"), 5)
            .await
            .unwrap()
            .is_empty());
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_bucket_wider_than_range_is_single_bucket() {
        let dir = TempDir::new().unwrap();
        let (buffer, engine) = setup(&dir);

        for (seconds, value) in [(0, 10.0f64), (3, 20.0f64), (6, 30.0f64), (9, 40.0f64)] {
            buffer.ingest(&DataChangeEvent::new("n1", value, at(seconds), 1)).unwrap();
        }
        buffer.flush_now().await.unwrap();

        let buckets = engine
            .query_bucketed(
                &NodeId::new("n1"),
                at(0),
                at(9),
                Duration::from_secs(60),
                Aggregator::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            buckets,
            vec![BucketPoint {
                bucket_start: at(0),
                value: Value::Float64(25.0),
                samples: 4,
            }]
        );
        buffer.shutdown().await;
    }

    fn by_hand(
        points: &[TrendPoint],
        start: DateTime<Utc>,
        width_ms: i64,
        aggregator: Aggregator,
    ) -> Vec<(DateTime<Utc>, Value)> {
        let mut groups: Vec<(i64, Vec<&Value>)> = Vec::new();
        for point in points {
            let index = (point.timestamp - start).num_milliseconds() / width_ms;
            match groups.last_mut() {
                Some((last, values)) if *last == index => values.push(&point.value),
                _ => groups.push((index, vec![&point.value])),
            }
        }

        groups
            .into_iter()
            .map(|(index, values)| {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                let value = match aggregator {
                    Aggregator::Last => values[values.len() - 1].clone(),
                    Aggregator::Average => {
                        Value::Float64(numbers.iter().sum::<f64>() / numbers.len() as f64)
                    }
                    Aggregator::Min => Value::Float64(numbers.iter().cloned().fold(f64::INFINITY, f64::min)),
                    Aggregator::Max => {
                        Value::Float64(numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
                    }
                };
                (start + chrono::Duration::milliseconds(index * width_ms), value)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bucketed_matches_aggregation_of_range_query() {
        let dir = TempDir::new().unwrap();
        let (buffer, engine) = setup(&dir);
        let node = NodeId::new("n1");

        buffer.ingest(&DataChangeEvent::new("n1", 3i32, at(0), 1)).unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 8.5f64, at(1), 1)).unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", -1i64, at(2), 1)).unwrap();
        buffer.ingest(&DataChangeEvent::new("other", 50.0f64, at(7), 1)).unwrap();
        buffer.flush_now().await.unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 4.0f64, at(12), 2)).unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 6i32, at(14), 2)).unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 10.0f64, at(15), 2)).unwrap();
        buffer.ingest(&DataChangeEvent::new("n1", 99.0f64, at(20), 2)).unwrap();

        let (start, end) = (at(0), at(15));
        let points = engine.query(&node, start, end).await.unwrap();
        assert_eq!(points.len(), 6);
        assert_eq!(points[5].timestamp, end);

        for aggregator in [Aggregator::Last, Aggregator::Average, Aggregator::Min, Aggregator::Max] {
            let buckets = engine
                .query_bucketed(&node, start, end, Duration::from_secs(5), aggregator)
                .await
                .unwrap();
            let actual: Vec<(DateTime<Utc>, Value)> = buckets
                .iter()
                .map(|b| (b.bucket_start, b.value.clone()))
                .collect();

            assert_eq!(actual, by_hand(&points, start, 5_000, aggregator), "{}", aggregator);
            // [5s, 10s) has no samples of n1; the point at `end` opens its own bucket.
            assert_eq!(
                buckets.iter().map(|b| b.bucket_start).collect::<Vec<_>>(),
                vec![at(0), at(10), at(15)]
            );
        }
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let dir = TempDir::new().unwrap();
        let (_buffer, engine) = setup(&dir);
        let node = NodeId::new("n1");

        let error = engine.query(&node, at(10), at(0)).await.unwrap_err();
        assert!(matches!(error, QueryError::InvalidRange { .. }));

        let error = engine
            .query_bucketed(&node, at(0), at(10), Duration::ZERO, Aggregator::Average)
            .await
            .unwrap_err();
        assert!(matches!(error, QueryError::InvalidBucket { .. }));
    }
}
