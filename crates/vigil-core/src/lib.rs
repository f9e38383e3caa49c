// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vigil-core
//!
//! Core abstractions and shared types for the Vigil protocol client runtime.
//!
//! This crate provides the foundational pieces used by the session,
//! subscription and historian crates:
//!
//! - **Types**: `NodeId`, `Value`, `DataChangeEvent`, `DataChangeListener`
//! - **Error**: Unified error hierarchy with retry classification
//! - **Retry**: `RetryPolicy` calculator and seedable `Backoff`
//! - **Fanout**: Bounded, drop-oldest distribution of live events
//!
//! ## Example
//!
//! ```
//! use vigil_core::fanout::{ConsumerOptions, NotificationFanout};
//! use vigil_core::types::DataChangeEvent;
//! use chrono::Utc;
//!
//! let fanout = NotificationFanout::<DataChangeEvent>::new(256);
//! let mut live = fanout.register(ConsumerOptions::new("websocket-1"));
//!
//! fanout.publish(&DataChangeEvent::new("ns=2;s=Speed", 12.5f64, Utc::now(), 1));
//! assert!(live.try_recv().is_some());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod error;
pub mod fanout;
pub mod retry;
pub mod serde_helpers;
pub mod types;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use error::{
    HistorianError, HistorianResult, QueryError, QueryResult, SessionError, SessionResult,
    VigilError, VigilResult,
};
pub use fanout::{
    ConsumerId, ConsumerOptions, ConsumerReceiver, ConsumerStats, FanoutStats, NotificationFanout,
};
pub use retry::{Backoff, RetryOutcome, RetryPolicy, Retryable};
pub use types::{DataChangeEvent, DataChangeListener, Generation, NodeId, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
