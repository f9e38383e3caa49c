// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server session and subscription layer for the Vigil runtime.
//!
//! This crate keeps one logical connection per remote automation server and
//! the set of monitored items a caller asked for, across any number of
//! physical reconnects.
//!
//! # Features
//!
//! - Session state machine with a monotonically increasing generation
//! - Keep-alive probing and exponential backoff reconnection
//! - Refcounted monitored items, replayed in subscribe order after reconnect
//! - Stale-generation and out-of-order notification discard
//! - Bounded live streams built on the core fan-out
//!
//! # Generations
//!
//! ```text
//! connect ──▶ Connected(g=1) ──lost──▶ Reconnecting ──▶ Connected(g=2) ──▶ ...
//!                 │                                         │
//!          items bound to g=1                        items replayed at g=2
//!                                                    late g=1 events dropped
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod types;

pub use types::{Endpoint, SecurityDescriptor, SecurityMode, SecurityPolicy};

pub use client::{
    EventStream, ServerItemId, ServerSession, SessionConfig, SessionEvent, SessionState,
    SessionStatus, SessionTransport, SimulatedTransport, SubscriptionConfig, SubscriptionEngine,
    SubscriptionHandle, SubscriptionSignal,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
