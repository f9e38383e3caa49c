// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Durable sinks for sealed batches.
//!
//! A sink write is all or nothing: after a failed write no part of the batch
//! is visible to readers.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use vigil_core::error::{HistorianError, HistorianResult};

use crate::batch::HistorianBatch;
use crate::store::{BatchStore, ResumePoint};

// =============================================================================
// BatchSink Trait
// =============================================================================

/// Destination of sealed batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Persists one batch atomically.
    async fn write_batch(&self, batch: &HistorianBatch) -> HistorianResult<()>;

    /// Returns where numbering continues for data already in the sink.
    fn resume_point(&self) -> HistorianResult<ResumePoint> {
        Ok(ResumePoint::default())
    }

    /// Returns the name of this sink for logging/metrics.
    fn name(&self) -> &str;
}

// =============================================================================
// FileBatchSink
// =============================================================================

/// Writes each batch to its own CSV file: temp file, fsync, rename,
/// directory fsync.
#[derive(Debug, Clone)]
pub struct FileBatchSink {
    store: BatchStore,
}

impl FileBatchSink {
    /// Creates a sink writing into `store`'s directory.
    pub fn new(store: BatchStore) -> Self {
        Self { store }
    }

    /// Opens a store at `dir` and creates a sink for it.
    pub fn open(dir: impl Into<std::path::PathBuf>) -> HistorianResult<Self> {
        Ok(Self::new(BatchStore::open(dir)?))
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &BatchStore {
        &self.store
    }
}

#[async_trait]
impl BatchSink for FileBatchSink {
    async fn write_batch(&self, batch: &HistorianBatch) -> HistorianResult<()> {
        let bytes = batch.to_csv()?;
        let temp = self.store.temp_path(batch.sequence);
        let target = self.store.batch_path(batch);
        let dir = self.store.dir().to_path_buf();

        tokio::task::spawn_blocking(move || write_atomic(&dir, &temp, &target, &bytes))
            .await
            .map_err(|e| HistorianError::sink_write(format!("write task failed: {}", e)))?
    }

    fn resume_point(&self) -> HistorianResult<ResumePoint> {
        self.store.resume_point()
    }

    fn name(&self) -> &str {
        "file"
    }
}

fn write_atomic(dir: &Path, temp: &Path, target: &Path, bytes: &[u8]) -> HistorianResult<()> {
    let result = (|| -> io::Result<()> {
        let mut file = File::create(temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(temp, target)?;
        sync_dir(dir)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(temp);
        return Err(HistorianError::sink_io(
            format!("writing {}", target.display()),
            e,
        ));
    }

    tracing::trace!(path = %target.display(), bytes = bytes.len(), "Batch committed");
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// =============================================================================
// Mock Batch Sink (for testing)
// =============================================================================

/// An in-memory sink for testing.
#[derive(Debug, Default)]
pub struct MockBatchSink {
    batches: Mutex<Vec<HistorianBatch>>,
    should_fail: AtomicBool,
    fail_next: AtomicU32,
    attempts: AtomicU64,
}

impl MockBatchSink {
    /// Creates a sink that accepts every batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that rejects every batch.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_should_fail(true);
        sink
    }

    /// Sets whether writes fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Returns the number of write attempts.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Returns the accepted batches.
    pub fn batches(&self) -> Vec<HistorianBatch> {
        self.batches.lock().clone()
    }

    /// Returns the number of accepted records.
    pub fn record_count(&self) -> usize {
        self.batches.lock().iter().map(HistorianBatch::len).sum()
    }
}

#[async_trait]
impl BatchSink for MockBatchSink {
    async fn write_batch(&self, batch: &HistorianBatch) -> HistorianResult<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(HistorianError::sink_write("mock sink unavailable"));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(HistorianError::sink_write("mock transient failure"));
        }

        self.batches.lock().push(batch.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::HistorianRecord;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use vigil_core::types::{NodeId, Value};

    fn batch(sequence: u64) -> HistorianBatch {
        HistorianBatch::new(
            sequence,
            vec![HistorianRecord {
                seq: sequence * 10,
                node_id: NodeId::new("n1"),
                value: Value::Float64(1.5),
                timestamp: Utc.timestamp_opt(1_700_000_000 + sequence as i64, 0).unwrap(),
                generation: 1,
            }],
        )
    }

    #[tokio::test]
    async fn test_file_sink_commits_atomically() {
        let dir = TempDir::new().unwrap();
        let sink = FileBatchSink::open(dir.path()).unwrap();

        sink.write_batch(&batch(1)).await.unwrap();
        sink.write_batch(&batch(2)).await.unwrap();

        let store = sink.store();
        assert_eq!(store.sequences().unwrap(), vec![1, 2]);
        assert!(!store.temp_path(2).exists());
        assert!(store.batch_path(&batch(2)).exists());
        assert_eq!(store.read_batch(2).unwrap().records[0].seq, 20);
        assert_eq!(
            sink.resume_point().unwrap(),
            ResumePoint {
                next_sequence: 3,
                next_record_seq: 21
            }
        );
    }

    #[tokio::test]
    async fn test_file_sink_failure_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("history");
        let sink = FileBatchSink::open(&data_dir).unwrap();

        fs::remove_dir_all(&data_dir).unwrap();
        let error = sink.write_batch(&batch(1)).await.unwrap_err();
        assert!(matches!(error, HistorianError::SinkWrite { .. }));
        assert!(error.is_retryable());

        fs::create_dir_all(&data_dir).unwrap();
        sink.write_batch(&batch(1)).await.unwrap();
        assert_eq!(sink.store().sequences().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_mock_sink_transient_failures() {
        let sink = MockBatchSink::new();
        sink.fail_next(2);

        assert!(sink.write_batch(&batch(1)).await.is_err());
        assert!(sink.write_batch(&batch(1)).await.is_err());
        assert!(sink.write_batch(&batch(1)).await.is_ok());
        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.record_count(), 1);
    }
}
