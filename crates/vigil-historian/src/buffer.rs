// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Historian buffer with batched, retried, atomic flushing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      HistorianBuffer                            │
//! │                                                                 │
//! │  ingest() ──▶ open batch ──seal──▶ outbox ──▶ in flight ──┐     │
//! │              (count or latency)    (FIFO)                 │     │
//! │                                                           ▼     │
//! │  ┌───────────────┐   tick / wake / shutdown   ┌──────────────┐  │
//! │  │ Flusher task  │──────────────────────────▶ │  BatchSink   │  │
//! │  │ RetryPolicy   │ ◀── failed batch retained ─│ (tmp+rename) │  │
//! │  └───────────────┘                            └──────────────┘  │
//! │                                                                 │
//! │  buffered > max_buffered_events ──▶ oldest records dropped,     │
//! │                                     HistorianSignal::Overflow   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ingest` never blocks on I/O. A batch is either fully committed by the
//! sink or kept in memory for the next attempt; it is never split.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vigil_core::error::{HistorianError, HistorianResult};
use vigil_core::retry::RetryPolicy;
use vigil_core::serde_helpers::duration_millis;
use vigil_core::types::{DataChangeEvent, DataChangeListener};

use crate::batch::{HistorianBatch, HistorianRecord};
use crate::metrics::HistorianMetricsCollector;
use crate::sink::BatchSink;

// =============================================================================
// Configuration
// =============================================================================

/// Historian settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistorianConfig {
    /// Whether history is recorded at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directory of committed batch files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// A batch is sealed once it holds this many records.
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    /// A non-empty batch is sealed once its first record is this old.
    #[serde(
        default = "default_max_batch_latency",
        rename = "max_batch_latency_ms",
        with = "duration_millis"
    )]
    pub max_batch_latency: Duration,

    /// How often the flusher checks for due batches.
    #[serde(
        default = "default_tick_interval",
        rename = "tick_interval_ms",
        with = "duration_millis"
    )]
    pub tick_interval: Duration,

    /// Bound on records held in memory. Beyond it the oldest are dropped.
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,

    /// Retry policy of a single batch write. Must be bounded.
    #[serde(default = "default_retry")]
    pub retry: RetryPolicy,

    /// Whether prometheus metrics are recorded.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/history")
}

fn default_max_batch_events() -> usize {
    500
}

fn default_max_batch_latency() -> Duration {
    Duration::from_millis(1000)
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_buffered_events() -> usize {
    100_000
}

fn default_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter_cap(Duration::from_millis(50))
        .with_max_attempts(5)
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            data_dir: default_data_dir(),
            max_batch_events: default_max_batch_events(),
            max_batch_latency: default_max_batch_latency(),
            tick_interval: default_tick_interval(),
            max_buffered_events: default_max_buffered_events(),
            retry: default_retry(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl HistorianConfig {
    /// Small batches, short timers and fast retries.
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("target/test-history"),
            max_batch_events: 4,
            max_batch_latency: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            max_buffered_events: 64,
            retry: RetryPolicy::for_testing().with_max_attempts(2),
            metrics_enabled: false,
        }
    }

    /// Sets the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the count threshold.
    pub fn with_max_batch_events(mut self, count: usize) -> Self {
        self.max_batch_events = count;
        self
    }

    /// Sets the latency threshold.
    pub fn with_max_batch_latency(mut self, latency: Duration) -> Self {
        self.max_batch_latency = latency;
        self
    }

    /// Sets the in-memory bound.
    pub fn with_max_buffered_events(mut self, count: usize) -> Self {
        self.max_buffered_events = count;
        self
    }

    /// Sets the write retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_events == 0 {
            return Err("max_batch_events must be greater than zero".to_string());
        }
        if self.max_batch_latency.is_zero() {
            return Err("max_batch_latency_ms must be greater than zero".to_string());
        }
        if self.tick_interval.is_zero() {
            return Err("tick_interval_ms must be greater than zero".to_string());
        }
        // One batch may be in flight and out of reach of the overflow policy.
        if self.max_buffered_events < self.max_batch_events * 2 {
            return Err(format!(
                "max_buffered_events ({}) must be at least twice max_batch_events ({})",
                self.max_buffered_events, self.max_batch_events
            ));
        }
        if self.retry.max_attempts.is_none() {
            return Err("historian retry.max_attempts must be set".to_string());
        }
        self.retry.validate().map_err(|e| format!("retry: {}", e))
    }
}

// =============================================================================
// Signals and status
// =============================================================================

/// Degraded-operation signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistorianSignal {
    /// Records were dropped to stay within the bound.
    Overflow {
        /// Records dropped by this ingest.
        dropped: u64,
        /// Records buffered afterwards.
        buffered: usize,
        /// Configured bound.
        max: usize,
    },

    /// A batch write gave up; the batch is kept for the next attempt.
    FlushFailed {
        /// Batch sequence.
        sequence: u64,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        message: String,
    },

    /// A write succeeded after earlier failures.
    FlushRecovered {
        /// Batch sequence.
        sequence: u64,
    },
}

/// Point-in-time view of the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Whether the flusher runs.
    pub running: bool,
    /// Records not yet committed.
    pub buffered: usize,
    /// Records in the open batch.
    pub open_records: usize,
    /// Sealed batches waiting for the sink.
    pub sealed_batches: usize,
    /// Whether the last write failed.
    pub failing: bool,
    /// Last write error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Counters.
    pub stats: HistorianStatsSnapshot,
}

// =============================================================================
// HistorianBuffer
// =============================================================================

/// Bounded in-memory staging for history with a background flusher.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HistorianBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    config: HistorianConfig,
    sink: Arc<dyn BatchSink>,
    state: Mutex<BufferState>,
    /// Serialises flush cycles of the flusher and `flush_now`.
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    shutdown: Notify,
    running: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    signals: broadcast::Sender<HistorianSignal>,
    stats: HistorianStats,
    metrics: HistorianMetricsCollector,
}

#[derive(Debug)]
struct BufferState {
    open: Vec<HistorianRecord>,
    opened_at: Option<Instant>,
    outbox: VecDeque<HistorianBatch>,
    in_flight: Option<HistorianBatch>,
    next_sequence: u64,
    next_record_seq: u64,
    failing: bool,
    overflowing: bool,
    last_error: Option<String>,
    closed: bool,
}

impl BufferState {
    fn buffered(&self) -> usize {
        self.open.len()
            + self.outbox.iter().map(HistorianBatch::len).sum::<usize>()
            + self.in_flight.as_ref().map_or(0, HistorianBatch::len)
    }

    fn seal(&mut self) -> Option<u64> {
        if self.open.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.open);
        self.opened_at = None;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.outbox.push_back(HistorianBatch::new(sequence, records));
        Some(sequence)
    }

    /// Drops `excess` records, oldest first. The in-flight batch is untouched.
    fn drop_oldest(&mut self, mut excess: usize) -> usize {
        let mut dropped = 0;
        while excess > 0 {
            if let Some(front) = self.outbox.front_mut() {
                let removed = front.drop_oldest(excess);
                dropped += removed;
                excess -= removed;
                if front.is_empty() {
                    self.outbox.pop_front();
                }
            } else if !self.open.is_empty() {
                let removed = excess.min(self.open.len());
                self.open.drain(..removed);
                if self.open.is_empty() {
                    self.opened_at = None;
                }
                dropped += removed;
                excess -= removed;
            } else {
                break;
            }
        }
        dropped
    }
}

impl HistorianBuffer {
    /// Creates a buffer writing to `sink`. Numbering resumes from the sink.
    pub fn new(config: HistorianConfig, sink: Arc<dyn BatchSink>) -> HistorianResult<Self> {
        config
            .validate()
            .map_err(HistorianError::invalid_config)?;
        let resume = sink.resume_point()?;
        let (signals, _) = broadcast::channel(256);

        debug!(
            sink = sink.name(),
            next_sequence = resume.next_sequence,
            next_record_seq = resume.next_record_seq,
            "Historian buffer created"
        );

        Ok(Self {
            inner: Arc::new(BufferInner {
                metrics: HistorianMetricsCollector::new(config.metrics_enabled),
                config,
                sink,
                state: Mutex::new(BufferState {
                    open: Vec::new(),
                    opened_at: None,
                    outbox: VecDeque::new(),
                    in_flight: None,
                    next_sequence: resume.next_sequence,
                    next_record_seq: resume.next_record_seq,
                    failing: false,
                    overflowing: false,
                    last_error: None,
                    closed: false,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
                flusher: Mutex::new(None),
                signals,
                stats: HistorianStats::default(),
            }),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HistorianConfig {
        &self.inner.config
    }

    /// Starts the background flusher.
    pub fn start(&self) -> HistorianResult<()> {
        if self.inner.state.lock().closed {
            return Err(HistorianError::NotRunning);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(HistorianError::AlreadyRunning);
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run().await });
        *self.inner.flusher.lock() = Some(handle);
        Ok(())
    }

    /// Returns `true` while the flusher runs.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Accepts one event. Never blocks on I/O.
    ///
    /// Returns the record's arrival sequence.
    pub fn ingest(&self, event: &DataChangeEvent) -> HistorianResult<u64> {
        let max = self.inner.config.max_buffered_events;

        let (seq, sealed, dropped, buffered, first_overflow) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(HistorianError::NotRunning);
            }

            let seq = state.next_record_seq;
            state.next_record_seq += 1;
            if state.open.is_empty() {
                state.opened_at = Some(Instant::now());
            }
            state.open.push(HistorianRecord::from_event(seq, event));

            let sealed = if state.open.len() >= self.inner.config.max_batch_events {
                state.seal()
            } else {
                None
            };

            let over = state.buffered().saturating_sub(max);
            let dropped = if over > 0 { state.drop_oldest(over) } else { 0 };
            let first_overflow = dropped > 0 && !state.overflowing;
            if dropped > 0 {
                state.overflowing = true;
            }

            (seq, sealed, dropped, state.buffered(), first_overflow)
        };

        self.inner.stats.record_ingested();
        self.inner.metrics.record_ingested(1);
        self.inner.metrics.update_buffered(buffered, max);

        if let Some(sequence) = sealed {
            self.inner.stats.record_sealed();
            self.inner.wake.notify_one();
            debug!(sequence, "Batch sealed by count");
        }

        if dropped > 0 {
            self.inner.stats.record_dropped(dropped as u64);
            self.inner.metrics.record_dropped(dropped as u64);
            let error = HistorianError::overflow(dropped as u64, max as u64);
            if first_overflow {
                warn!(buffered, max, error = %error, "Historian buffer overflow, dropping oldest records");
            } else {
                debug!(dropped, buffered, "Historian buffer still overflowing");
            }
            let _ = self.inner.signals.send(HistorianSignal::Overflow {
                dropped: dropped as u64,
                buffered,
                max,
            });
        }

        Ok(seq)
    }

    /// Seals the open batch and writes everything pending.
    ///
    /// Fails if a batch could not be written; it stays buffered.
    pub async fn flush_now(&self) -> HistorianResult<()> {
        if self.inner.flush_cycle(true).await {
            Ok(())
        } else {
            let message = self
                .inner
                .state
                .lock()
                .last_error
                .clone()
                .unwrap_or_else(|| "flush failed".to_string());
            Err(HistorianError::sink_write(message))
        }
    }

    /// Stops accepting records, flushes what remains and stops the flusher.
    pub async fn shutdown(&self) {
        self.inner.state.lock().closed = true;

        let handle = self.inner.flusher.lock().take();
        match handle {
            Some(handle) => {
                self.inner.shutdown.notify_one();
                let _ = handle.await;
            }
            None => {
                self.inner.flush_cycle(true).await;
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);

        let remaining = self.buffered();
        if remaining > 0 {
            warn!(remaining, "Historian stopped with unflushed records");
        } else {
            info!("Historian buffer shut down");
        }
    }

    /// Records accepted but not yet committed, oldest first.
    pub fn pending_records(&self) -> Vec<HistorianRecord> {
        let state = self.inner.state.lock();
        let mut records = Vec::with_capacity(state.buffered());
        if let Some(batch) = &state.in_flight {
            records.extend(batch.records.iter().cloned());
        }
        for batch in &state.outbox {
            records.extend(batch.records.iter().cloned());
        }
        records.extend(state.open.iter().cloned());
        records
    }

    /// Number of records not yet committed.
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffered()
    }

    /// Subscribes to degraded-operation signals.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<HistorianSignal> {
        self.inner.signals.subscribe()
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &HistorianStats {
        &self.inner.stats
    }

    /// Returns a status snapshot.
    pub fn status(&self) -> BufferStatus {
        let state = self.inner.state.lock();
        BufferStatus {
            running: self.is_running(),
            buffered: state.buffered(),
            open_records: state.open.len(),
            sealed_batches: state.outbox.len() + usize::from(state.in_flight.is_some()),
            failing: state.failing,
            last_error: state.last_error.clone(),
            stats: self.inner.stats.snapshot(),
        }
    }
}

impl DataChangeListener for HistorianBuffer {
    fn name(&self) -> &str {
        "historian"
    }

    fn on_data_change(&self, event: &DataChangeEvent) {
        if let Err(error) = self.ingest(event) {
            debug!(node_id = %event.node_id, error = %error, "Event not recorded");
        }
    }
}

// =============================================================================
// Flusher
// =============================================================================

impl BufferInner {
    async fn run(self: Arc<Self>) {
        info!(
            sink = self.sink.name(),
            max_batch_events = self.config.max_batch_events,
            max_batch_latency_ms = self.config.max_batch_latency.as_millis() as u64,
            "Historian flusher started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            self.flush_cycle(false).await;
        }

        // Final flush
        self.flush_cycle(true).await;
        info!("Historian flusher stopped");
    }

    /// Seals a due (or, with `force`, any) open batch and writes the outbox.
    ///
    /// Returns `false` if a batch had to be retained.
    async fn flush_cycle(&self, force: bool) -> bool {
        let _cycle = self.flush_lock.lock().await;

        {
            let mut state = self.state.lock();
            let due = state
                .opened_at
                .map_or(false, |opened| opened.elapsed() >= self.config.max_batch_latency);
            if force || due {
                if let Some(sequence) = state.seal() {
                    self.stats.record_sealed();
                    debug!(sequence, forced = force, "Batch sealed by latency");
                }
            }
        }

        loop {
            let batch = {
                let mut state = self.state.lock();
                match state.outbox.pop_front() {
                    Some(batch) => {
                        state.in_flight = Some(batch.clone());
                        batch
                    }
                    None => return true,
                }
            };

            if !self.write(batch).await {
                return false;
            }
        }
    }

    async fn write(&self, batch: HistorianBatch) -> bool {
        let sequence = batch.sequence;
        let records = batch.len();
        let started = std::time::Instant::now();

        let sink = self.sink.as_ref();
        let pending = &batch;
        let outcome = self
            .config
            .retry
            .execute(move || sink.write_batch(pending))
            .await;
        self.stats.record_write_attempts(outcome.attempts);

        match outcome.result {
            Ok(()) => {
                let (recovered, buffered) = {
                    let mut state = self.state.lock();
                    state.in_flight = None;
                    state.overflowing = false;
                    state.last_error = None;
                    let recovered = std::mem::replace(&mut state.failing, false);
                    (recovered, state.buffered())
                };

                self.stats.record_flushed(records as u64);
                self.metrics.record_flush_success(
                    records,
                    outcome.attempts,
                    started.elapsed().as_secs_f64(),
                );
                self.metrics
                    .update_buffered(buffered, self.config.max_buffered_events);
                debug!(sequence, records, attempts = outcome.attempts, "Batch flushed");

                if recovered {
                    info!(sequence, "Historian sink recovered");
                    let _ = self.signals.send(HistorianSignal::FlushRecovered { sequence });
                }
                true
            }
            Err(error) => {
                let message = error.to_string();
                {
                    let mut state = self.state.lock();
                    state.in_flight = None;
                    state.outbox.push_front(batch);
                    state.failing = true;
                    state.last_error = Some(message.clone());
                }

                self.stats.record_flush_failure();
                self.metrics
                    .record_flush_error(error.error_type(), outcome.attempts);
                warn!(
                    sequence,
                    records,
                    attempts = outcome.attempts,
                    error = %error,
                    "Batch flush failed, batch retained"
                );
                let _ = self.signals.send(HistorianSignal::FlushFailed {
                    sequence,
                    attempts: outcome.attempts,
                    message,
                });
                false
            }
        }
    }
}

// =============================================================================
// HistorianStats
// =============================================================================

/// Statistics for the historian buffer.
#[derive(Debug, Default)]
pub struct HistorianStats {
    ingested: AtomicU64,
    dropped: AtomicU64,
    batches_sealed: AtomicU64,
    batches_flushed: AtomicU64,
    records_flushed: AtomicU64,
    flush_failures: AtomicU64,
    write_attempts: AtomicU64,
    last_flush_ms: AtomicU64,
}

impl HistorianStats {
    fn record_ingested(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    fn record_sealed(&self) {
        self.batches_sealed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_flushed(&self, records: u64) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.records_flushed.fetch_add(records, Ordering::Relaxed);
        self.last_flush_ms
            .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);
    }

    fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write_attempts(&self, attempts: u32) {
        self.write_attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
    }

    /// Records accepted.
    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    /// Records dropped on overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Batches sealed.
    pub fn batches_sealed(&self) -> u64 {
        self.batches_sealed.load(Ordering::Relaxed)
    }

    /// Batches committed.
    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    /// Records committed.
    pub fn records_flushed(&self) -> u64 {
        self.records_flushed.load(Ordering::Relaxed)
    }

    /// Batch writes that gave up.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    /// Sink write attempts, retries included.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Relaxed)
    }

    /// Returns a serialisable snapshot.
    pub fn snapshot(&self) -> HistorianStatsSnapshot {
        let last_flush_ms = self.last_flush_ms.load(Ordering::Relaxed);
        HistorianStatsSnapshot {
            ingested: self.ingested(),
            dropped: self.dropped(),
            batches_sealed: self.batches_sealed(),
            batches_flushed: self.batches_flushed(),
            records_flushed: self.records_flushed(),
            flush_failures: self.flush_failures(),
            write_attempts: self.write_attempts(),
            last_flush: (last_flush_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_flush_ms as i64).single())
                .flatten(),
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        self.ingested.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.batches_sealed.store(0, Ordering::Relaxed);
        self.batches_flushed.store(0, Ordering::Relaxed);
        self.records_flushed.store(0, Ordering::Relaxed);
        self.flush_failures.store(0, Ordering::Relaxed);
        self.write_attempts.store(0, Ordering::Relaxed);
        self.last_flush_ms.store(0, Ordering::Relaxed);
    }
}

/// Serialisable historian counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorianStatsSnapshot {
    /// Records accepted.
    pub ingested: u64,
    /// Records dropped on overflow.
    pub dropped: u64,
    /// Batches sealed.
    pub batches_sealed: u64,
    /// Batches committed.
    pub batches_flushed: u64,
    /// Records committed.
    pub records_flushed: u64,
    /// Batch writes that gave up.
    pub flush_failures: u64,
    /// Sink write attempts.
    pub write_attempts: u64,
    /// Time of the last commit.
    pub last_flush: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{FileBatchSink, MockBatchSink};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(3);

    fn event(index: i64) -> DataChangeEvent {
        DataChangeEvent::new(
            "ns=2;s=Level",
            index as f64,
            Utc.timestamp_opt(1_700_000_000 + index, 0).unwrap(),
            1,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn next_signal(
        signals: &mut broadcast::Receiver<HistorianSignal>,
        matches: impl Fn(&HistorianSignal) -> bool,
    ) -> HistorianSignal {
        loop {
            let signal = tokio::time::timeout(WAIT, signals.recv())
                .await
                .expect("signal in time")
                .unwrap();
            if matches(&signal) {
                return signal;
            }
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(HistorianConfig::default().validate().is_ok());
        assert!(HistorianConfig::for_testing().validate().is_ok());

        let config = HistorianConfig::for_testing().with_max_batch_events(0);
        assert!(config.validate().is_err());

        let config = HistorianConfig::for_testing().with_max_buffered_events(5);
        assert!(config.validate().is_err());

        let config = HistorianConfig::for_testing().with_retry(RetryPolicy::for_testing());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_names() {
        let config: HistorianConfig = serde_json::from_str(
            r#"{"max_batch_events": 10, "max_batch_latency_ms": 250, "tick_interval_ms": 20}"#,
        )
        .unwrap();
        assert_eq!(config.max_batch_events, 10);
        assert_eq!(config.max_batch_latency, Duration::from_millis(250));
        assert_eq!(config.tick_interval, Duration::from_millis(20));

        let unknown = serde_json::from_str::<HistorianConfig>(r#"{"batch_size": 10}"#);
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn test_seal_by_count() {
        let sink = Arc::new(MockBatchSink::new());
        let buffer = HistorianBuffer::new(HistorianConfig::for_testing(), sink.clone()).unwrap();
        buffer.start().unwrap();

        for i in 0..8 {
            buffer.ingest(&event(i)).unwrap();
        }

        wait_until(|| sink.batches().len() == 2).await;
        let batches = sink.batches();
        assert_eq!(batches[0].sequence, 1);
        assert_eq!(batches[1].sequence, 2);
        assert!(batches.iter().all(|b| b.len() == 4));
        assert_eq!(
            batches[1].records.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![5, 6, 7, 8]
        );

        buffer.shutdown().await;
        assert_eq!(buffer.stats().records_flushed(), 8);
    }

    #[tokio::test]
    async fn test_seal_by_latency() {
        let sink = Arc::new(MockBatchSink::new());
        let buffer = HistorianBuffer::new(HistorianConfig::for_testing(), sink.clone()).unwrap();
        buffer.start().unwrap();

        buffer.ingest(&event(0)).unwrap();
        wait_until(|| sink.record_count() == 1).await;
        assert_eq!(buffer.buffered(), 0);

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let sink = Arc::new(MockBatchSink::new());
        sink.fail_next(1);
        let buffer = HistorianBuffer::new(HistorianConfig::for_testing(), sink.clone()).unwrap();

        for i in 0..3 {
            buffer.ingest(&event(i)).unwrap();
        }
        buffer.flush_now().await.unwrap();

        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.record_count(), 3);
        assert_eq!(buffer.stats().flush_failures(), 0);
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_batch_is_retained_until_recovery() {
        let sink = Arc::new(MockBatchSink::failing());
        let buffer = HistorianBuffer::new(HistorianConfig::for_testing(), sink.clone()).unwrap();
        let mut signals = buffer.subscribe_signals();
        buffer.start().unwrap();

        for i in 0..4 {
            buffer.ingest(&event(i)).unwrap();
        }

        next_signal(&mut signals, |s| matches!(s, HistorianSignal::FlushFailed { sequence: 1, .. })).await;
        assert_eq!(buffer.pending_records().len(), 4);
        assert!(buffer.status().failing);
        assert!(buffer.flush_now().await.is_err());

        sink.set_should_fail(false);
        next_signal(&mut signals, |s| matches!(s, HistorianSignal::FlushRecovered { sequence: 1 })).await;
        assert_eq!(sink.record_count(), 4);
        assert!(buffer.pending_records().is_empty());
        assert!(!buffer.status().failing);

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let sink = Arc::new(MockBatchSink::failing());
        let config = HistorianConfig::for_testing().with_max_buffered_events(8);
        let buffer = HistorianBuffer::new(config, sink).unwrap();
        let mut signals = buffer.subscribe_signals();

        for i in 0..12 {
            buffer.ingest(&event(i)).unwrap();
        }

        let pending: Vec<u64> = buffer.pending_records().iter().map(|r| r.seq).collect();
        assert_eq!(pending, (5..=12).collect::<Vec<_>>());
        assert_eq!(buffer.stats().dropped(), 4);

        let signal = next_signal(&mut signals, |s| matches!(s, HistorianSignal::Overflow { .. })).await;
        assert_eq!(
            signal,
            HistorianSignal::Overflow {
                dropped: 1,
                buffered: 8,
                max: 8
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let sink = Arc::new(MockBatchSink::new());
        let buffer = HistorianBuffer::new(HistorianConfig::for_testing(), sink.clone()).unwrap();
        buffer.start().unwrap();
        assert!(matches!(buffer.start(), Err(HistorianError::AlreadyRunning)));

        buffer.ingest(&event(0)).unwrap();
        buffer.ingest(&event(1)).unwrap();
        buffer.shutdown().await;

        assert_eq!(sink.record_count(), 2);
        assert!(!buffer.is_running());
        assert!(matches!(buffer.ingest(&event(2)), Err(HistorianError::NotRunning)));
        assert!(matches!(buffer.start(), Err(HistorianError::NotRunning)));
    }

    #[tokio::test]
    async fn test_numbering_resumes_from_file_sink() {
        let dir = TempDir::new().unwrap();
        let config = HistorianConfig::for_testing().with_data_dir(dir.path());

        let first = HistorianBuffer::new(
            config.clone(),
            Arc::new(FileBatchSink::open(dir.path()).unwrap()),
        )
        .unwrap();
        for i in 0..3 {
            first.ingest(&event(i)).unwrap();
        }
        first.shutdown().await;

        let sink = Arc::new(FileBatchSink::open(dir.path()).unwrap());
        let second = HistorianBuffer::new(config, sink.clone()).unwrap();
        assert_eq!(second.ingest(&event(3)).unwrap(), 4);
        second.flush_now().await.unwrap();

        assert_eq!(sink.store().sequences().unwrap(), vec![1, 2]);
        second.shutdown().await;
    }
}
