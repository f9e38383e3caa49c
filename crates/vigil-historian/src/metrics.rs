// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Prometheus metrics for the historian.
//!
//! # Metrics Overview
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `vigil_historian_records_ingested_total` | Counter | Records accepted |
//! | `vigil_historian_records_flushed_total` | Counter | Records committed |
//! | `vigil_historian_records_dropped_total` | Counter | Records dropped on overflow |
//! | `vigil_historian_buffered_records` | Gauge | Records not yet committed |
//! | `vigil_historian_fill_ratio` | Gauge | Buffered records / bound |
//! | `vigil_historian_batches_flushed_total` | Counter | Batches committed |
//! | `vigil_historian_flush_duration_seconds` | Histogram | Batch write duration |
//! | `vigil_historian_flush_errors_total` | Counter | Flush errors by type |
//! | `vigil_historian_retry_attempts` | Histogram | Attempts per batch write |

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};

// =============================================================================
// Metric Definitions
// =============================================================================

static RECORDS_INGESTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_historian_records_ingested_total",
        "Total number of records accepted by the historian"
    )
    .expect("Failed to register records_ingested_total metric")
});

static RECORDS_FLUSHED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_historian_records_flushed_total",
        "Total number of records committed to the sink"
    )
    .expect("Failed to register records_flushed_total metric")
});

static RECORDS_DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_historian_records_dropped_total",
        "Total number of records dropped because the buffer bound was exceeded"
    )
    .expect("Failed to register records_dropped_total metric")
});

static BUFFERED_RECORDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "vigil_historian_buffered_records",
        "Records accepted but not yet committed"
    )
    .expect("Failed to register buffered_records metric")
});

static FILL_RATIO: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "vigil_historian_fill_ratio",
        "Buffer fill ratio (0.0 to 1.0)"
    )
    .expect("Failed to register fill_ratio metric")
});

static BATCHES_FLUSHED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_historian_batches_flushed_total",
        "Total number of batches committed"
    )
    .expect("Failed to register batches_flushed_total metric")
});

static FLUSH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "vigil_historian_flush_duration_seconds",
        "Duration of batch writes in seconds, retries included",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register flush_duration metric")
});

static FLUSH_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_historian_flush_errors_total",
        "Total number of failed batch writes by error type",
        &["error_type"]
    )
    .expect("Failed to register flush_errors metric")
});

static RETRY_ATTEMPTS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "vigil_historian_retry_attempts",
        "Number of attempts per batch write",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0]
    )
    .expect("Failed to register retry_attempts metric")
});

// =============================================================================
// Metrics Collector
// =============================================================================

/// Records historian metrics. A disabled collector does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistorianMetricsCollector {
    enabled: bool,
}

impl HistorianMetricsCollector {
    /// Creates a new metrics collector.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Creates a disabled metrics collector (no-op).
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Returns whether metrics collection is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records accepted records.
    pub fn record_ingested(&self, count: u64) {
        if !self.enabled {
            return;
        }
        RECORDS_INGESTED_TOTAL.inc_by(count as f64);
    }

    /// Records dropped records.
    pub fn record_dropped(&self, count: u64) {
        if !self.enabled {
            return;
        }
        RECORDS_DROPPED_TOTAL.inc_by(count as f64);
    }

    /// Updates the buffered gauges.
    pub fn update_buffered(&self, buffered: usize, max: usize) {
        if !self.enabled {
            return;
        }
        BUFFERED_RECORDS.set(buffered as f64);
        let ratio = if max > 0 {
            buffered as f64 / max as f64
        } else {
            0.0
        };
        FILL_RATIO.set(ratio);
    }

    /// Records a committed batch.
    pub fn record_flush_success(&self, records: usize, attempts: u32, duration_secs: f64) {
        if !self.enabled {
            return;
        }
        BATCHES_FLUSHED_TOTAL.inc();
        RECORDS_FLUSHED_TOTAL.inc_by(records as f64);
        RETRY_ATTEMPTS.observe(attempts as f64);
        FLUSH_DURATION.observe(duration_secs);
    }

    /// Records a batch write that gave up.
    pub fn record_flush_error(&self, error_type: &str, attempts: u32) {
        if !self.enabled {
            return;
        }
        FLUSH_ERRORS.with_label_values(&[error_type]).inc();
        RETRY_ATTEMPTS.observe(attempts as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_disabled() {
        let collector = HistorianMetricsCollector::disabled();
        assert!(!collector.is_enabled());

        collector.record_ingested(100);
        collector.record_dropped(5);
        collector.update_buffered(10, 100);
    }

    #[test]
    fn test_metrics_collector_enabled() {
        let collector = HistorianMetricsCollector::new(true);
        assert!(collector.is_enabled());

        collector.record_ingested(100);
        collector.record_dropped(5);
        collector.update_buffered(45, 100);
        collector.update_buffered(0, 0);
        collector.record_flush_success(50, 2, 0.01);
        collector.record_flush_error("sink_write", 3);
    }
}
