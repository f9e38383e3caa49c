// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Directory of committed batch files.
//!
//! Only files whose names parse as a [`BatchFileName`] are considered
//! committed. Unfinished temp files are removed when the store is opened.
//! Reads use the timestamp span in each file name to skip files that
//! cannot contribute.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use vigil_core::error::{HistorianError, HistorianResult};
use vigil_core::types::NodeId;

use crate::batch::{floor_millis, BatchFileName, HistorianBatch, HistorianRecord};

// =============================================================================
// ResumePoint
// =============================================================================

/// Where numbering continues after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// Sequence of the next batch.
    pub next_sequence: u64,

    /// Sequence of the next record.
    pub next_record_seq: u64,
}

impl Default for ResumePoint {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            next_record_seq: 1,
        }
    }
}

// =============================================================================
// BatchStore
// =============================================================================

/// Read access to a directory of committed batches.
#[derive(Debug, Clone)]
pub struct BatchStore {
    dir: PathBuf,
}

impl BatchStore {
    /// Opens (and creates) a batch directory, removing unfinished writes.
    pub fn open(dir: impl Into<PathBuf>) -> HistorianResult<Self> {
        let store = Self { dir: dir.into() };
        fs::create_dir_all(&store.dir).map_err(|e| {
            HistorianError::sink_io(format!("creating {}", store.dir.display()), e)
        })?;

        let removed = store.remove_temp_files()?;
        if removed > 0 {
            tracing::warn!(
                dir = %store.dir.display(),
                removed,
                "Removed unfinished batch files"
            );
        }
        Ok(store)
    }

    /// Directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the committed file for `batch`.
    pub fn batch_path(&self, batch: &HistorianBatch) -> PathBuf {
        self.path_of(&batch.file_name())
    }

    /// Path of the temp file for `sequence`.
    pub fn temp_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(HistorianBatch::temp_file_name(sequence))
    }

    fn path_of(&self, name: &BatchFileName) -> PathBuf {
        self.dir.join(name.to_string())
    }

    fn entries(&self) -> HistorianResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            HistorianError::read_io(format!("listing {}", self.dir.display()), e)
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                HistorianError::read_io(format!("listing {}", self.dir.display()), e)
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Removes unfinished batch writes. Returns how many were removed.
    pub fn remove_temp_files(&self) -> HistorianResult<usize> {
        let mut removed = 0;
        for name in self.entries()? {
            if HistorianBatch::is_temp_file_name(&name) {
                let path = self.dir.join(&name);
                fs::remove_file(&path).map_err(|e| {
                    HistorianError::sink_io(format!("removing {}", path.display()), e)
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Committed batch files in ascending sequence order.
    pub fn files(&self) -> HistorianResult<Vec<BatchFileName>> {
        let mut files: Vec<BatchFileName> = self
            .entries()?
            .iter()
            .filter_map(|name| BatchFileName::parse(name))
            .collect();
        files.sort_unstable_by_key(|file| file.sequence);
        Ok(files)
    }

    /// Committed batch sequences in ascending order.
    pub fn sequences(&self) -> HistorianResult<Vec<u64>> {
        Ok(self.files()?.into_iter().map(|file| file.sequence).collect())
    }

    /// Reads one committed batch file.
    pub fn read_file(&self, name: &BatchFileName) -> HistorianResult<HistorianBatch> {
        let path = self.path_of(name);
        let bytes = fs::read(&path)
            .map_err(|e| HistorianError::read_io(format!("reading {}", path.display()), e))?;
        HistorianBatch::from_csv(&path, name.sequence, &bytes)
    }

    /// Reads the committed batch with `sequence`.
    pub fn read_batch(&self, sequence: u64) -> HistorianResult<HistorianBatch> {
        let name = self
            .files()?
            .into_iter()
            .find(|file| file.sequence == sequence)
            .ok_or_else(|| HistorianError::read(format!("batch {} not found", sequence)))?;
        self.read_file(&name)
    }

    /// Computes where batch and record numbering continue.
    pub fn resume_point(&self) -> HistorianResult<ResumePoint> {
        let Some(last) = self.files()?.pop() else {
            return Ok(ResumePoint::default());
        };
        let batch = self.read_file(&last)?;
        Ok(ResumePoint {
            next_sequence: last.sequence + 1,
            next_record_seq: batch.max_record_seq().map_or(1, |seq| seq + 1),
        })
    }

    /// Returns the committed records of `node_id`, optionally within
    /// `[start, end]`, in file order.
    pub fn scan(
        &self,
        node_id: &NodeId,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> HistorianResult<Vec<HistorianRecord>> {
        let mut records = Vec::new();
        for file in self.files()? {
            match window {
                Some((start, end)) if !file.may_overlap(start, end) => continue,
                None if file.span.is_none() => continue,
                _ => {}
            }
            let batch = self.read_file(&file)?;
            records.extend(batch.records.into_iter().filter(|record| {
                &record.node_id == node_id
                    && window.map_or(true, |(start, end)| record.within(start, end))
            }));
        }
        Ok(records)
    }

    /// Returns the `n` newest committed records of `node_id` ordered by
    /// `(timestamp, seq)`.
    ///
    /// Files are visited newest span first; the scan stops once no remaining
    /// file can hold a record newer than the oldest one kept.
    pub fn scan_latest(&self, node_id: &NodeId, n: usize) -> HistorianResult<Vec<HistorianRecord>> {
        let mut files: Vec<BatchFileName> = self
            .files()?
            .into_iter()
            .filter(|file| file.span.is_some())
            .collect();
        files.sort_unstable_by_key(|file| Reverse((file.newest_millis(), file.sequence)));

        let mut kept: Vec<HistorianRecord> = Vec::new();
        if n == 0 {
            return Ok(kept);
        }

        for file in files {
            if kept.len() == n {
                let oldest_kept = floor_millis(kept[0].timestamp);
                if file.newest_millis().map_or(true, |newest| newest < oldest_kept) {
                    break;
                }
            }

            let batch = self.read_file(&file)?;
            kept.extend(
                batch
                    .records
                    .into_iter()
                    .filter(|record| &record.node_id == node_id),
            );
            kept.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
            if kept.len() > n {
                kept.drain(..kept.len() - n);
            }
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use vigil_core::types::Value;

    fn write(store: &BatchStore, batch: &HistorianBatch) {
        fs::write(store.batch_path(batch), batch.to_csv().unwrap()).unwrap();
    }

    fn record(seq: u64, node: &str, seconds: i64) -> HistorianRecord {
        HistorianRecord {
            seq,
            node_id: NodeId::new(node),
            value: Value::Int64(seconds),
            timestamp: Utc.timestamp_opt(seconds, 0).unwrap(),
            generation: 1,
        }
    }

    fn seqs(records: &[HistorianRecord]) -> Vec<u64> {
        records.iter().map(|r| r.seq).collect()
    }

    #[test]
    fn test_open_removes_temp_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(HistorianBatch::temp_file_name(3)), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let store = BatchStore::open(dir.path()).unwrap();
        assert!(!store.temp_path(3).exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(store.sequences().unwrap().is_empty());
        assert_eq!(store.resume_point().unwrap(), ResumePoint::default());
    }

    #[test]
    fn test_resume_point_and_scan() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::open(dir.path().join("history")).unwrap();

        write(&store, &HistorianBatch::new(1, vec![record(1, "a", 0), record(2, "b", 1)]));
        write(&store, &HistorianBatch::new(2, vec![record(3, "a", 5), record(4, "a", 9)]));

        assert_eq!(store.sequences().unwrap(), vec![1, 2]);
        assert_eq!(store.read_batch(2).unwrap().len(), 2);
        assert!(store.read_batch(3).is_err());
        assert_eq!(
            store.resume_point().unwrap(),
            ResumePoint {
                next_sequence: 3,
                next_record_seq: 5
            }
        );

        let all = store.scan(&NodeId::new("a"), None).unwrap();
        assert_eq!(seqs(&all), vec![1, 3, 4]);

        let window = (Utc.timestamp_opt(1, 0).unwrap(), Utc.timestamp_opt(5, 0).unwrap());
        let windowed = store.scan(&NodeId::new("a"), Some(window)).unwrap();
        assert_eq!(seqs(&windowed), vec![3]);
    }

    #[test]
    fn test_scan_skips_files_outside_the_window() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::open(dir.path()).unwrap();

        write(&store, &HistorianBatch::new(1, vec![record(1, "a", 0), record(2, "a", 4)]));
        let late = HistorianBatch::new(2, vec![record(3, "a", 10)]);
        // Unreadable content behind a name whose span lies outside the window.
        fs::write(store.batch_path(&late), b"garbage").unwrap();

        let window = (Utc.timestamp_opt(0, 0).unwrap(), Utc.timestamp_opt(5, 0).unwrap());
        let records = store.scan(&NodeId::new("a"), Some(window)).unwrap();
        assert_eq!(seqs(&records), vec![1, 2]);

        assert!(store.scan(&NodeId::new("a"), None).is_err());
    }

    #[test]
    fn test_scan_latest_reads_only_newest_files() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::open(dir.path()).unwrap();

        let old = HistorianBatch::new(1, vec![record(1, "a", 0), record(2, "a", 1)]);
        fs::write(store.batch_path(&old), b"garbage").unwrap();
        write(&store, &HistorianBatch::new(2, vec![record(3, "a", 7), record(4, "b", 8)]));
        write(&store, &HistorianBatch::new(3, vec![record(5, "a", 5), record(6, "a", 9)]));

        let latest = store.scan_latest(&NodeId::new("a"), 3).unwrap();
        assert_eq!(seqs(&latest), vec![5, 3, 6]);

        assert!(store.scan_latest(&NodeId::new("a"), 0).unwrap().is_empty());
        // Asking for more than the newest files hold reaches the broken one.
        assert!(store.scan_latest(&NodeId::new("a"), 4).is_err());
    }

    #[test]
    fn test_scan_latest_keeps_ties_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::open(dir.path()).unwrap();

        write(&store, &HistorianBatch::new(1, vec![record(1, "a", 5), record(2, "a", 5)]));
        write(&store, &HistorianBatch::new(2, vec![record(3, "a", 5)]));

        let latest = store.scan_latest(&NodeId::new("a"), 2).unwrap();
        assert_eq!(seqs(&latest), vec![2, 3]);
    }

    #[test]
    fn test_corrupted_batch_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::open(dir.path()).unwrap();
        let batch = HistorianBatch::new(1, vec![record(1, "a", 0)]);
        fs::write(store.batch_path(&batch), b"garbage").unwrap();

        let error = store.scan(&NodeId::new("a"), None).unwrap_err();
        assert!(matches!(error, HistorianError::CorruptedBatch { .. }));
    }
}
