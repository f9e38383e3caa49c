// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vigil-historian
//!
//! Batched, durable history for live data changes and trend queries over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  DataChangeEvent  ┌─────────────────┐
//! │ HistorianRecorder│──────────────────▶│ HistorianBuffer │
//! │ (subscriptions)  │                   │  open ─▶ sealed │
//! └──────────────────┘                   └────────┬────────┘
//!                                                 │ flusher (retry)
//!                                                 ▼
//!                                        ┌─────────────────┐
//!                                        │  FileBatchSink  │
//!                                        │ tmp ─▶ rename   │
//!                                        └────────┬────────┘
//!                                                 │ batch-N.csv
//!                                                 ▼
//!                            ┌─────────────────────────────────────┐
//!                            │ TrendQueryEngine (store + pending)  │
//!                            │ query / query_bucketed / last_n     │
//!                            └─────────────────────────────────────┘
//! ```
//!
//! A batch is sealed when it reaches `max_batch_events` records or its
//! oldest record is older than `max_batch_latency`. Each sealed batch is
//! committed as a single file; readers never observe a partial batch.
//! Queries merge committed batches with records still in memory.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod batch;
pub mod buffer;
pub mod metrics;
pub mod query;
pub mod recorder;
pub mod sink;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use batch::{HistorianBatch, HistorianRecord};
pub use buffer::{
    BufferStatus, HistorianBuffer, HistorianConfig, HistorianSignal, HistorianStats,
    HistorianStatsSnapshot,
};
pub use metrics::HistorianMetricsCollector;
pub use query::{aggregate, Aggregator, BucketPoint, TrendPoint, TrendQueryEngine};
pub use recorder::{HistorianRecorder, RecorderStatus};
pub use sink::{BatchSink, FileBatchSink, MockBatchSink};
pub use store::{BatchStore, ResumePoint};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
