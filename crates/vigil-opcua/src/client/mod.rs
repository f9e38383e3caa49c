// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server session and subscription client.
//!
//! - **Transport Layer**: Abstract transport trait for the wire protocol
//! - **Session**: Connection state machine with generations and reconnection
//! - **Subscriptions**: Refcounted monitored items replayed after reconnect
//! - **Simulation**: In-process server for the runtime and tests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   SubscriptionEngine                            │
//! │        (items, replay, stale discard, fan-out, listeners)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ServerSession                               │
//! │     (state machine, generation counter, keep-alive, backoff)    │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   SessionTransport                              │
//! │                 (Abstract transport layer)                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vigil_opcua::client::{ServerSession, SessionConfig, SimulatedTransport,
//!     SubscriptionConfig, SubscriptionEngine};
//! use vigil_opcua::types::Endpoint;
//!
//! let session = ServerSession::new(
//!     Endpoint::new("opc.tcp://localhost:4840"),
//!     Arc::new(SimulatedTransport::new()),
//!     SessionConfig::default(),
//! )?;
//! let engine = SubscriptionEngine::new(session.clone(), SubscriptionConfig::default())?;
//! session.connect().await?;
//!
//! let mut stream = engine
//!     .stream(["ns=2;s=Temperature"], Duration::from_millis(500), 256)
//!     .await?;
//! while let Some(event) = stream.next().await {
//!     println!("{} = {}", event.node_id, event.value);
//! }
//! ```

mod session;
mod simulated;
pub mod subscription;
mod transport;

pub use session::{
    InvalidTransition, ServerSession, SessionConfig, SessionEvent, SessionInput,
    SessionNotification, SessionState, SessionStats, SessionStatus,
};
pub use simulated::SimulatedTransport;
pub use subscription::{
    EventStream, ItemInfo, ItemState, SubscriptionConfig, SubscriptionEngine,
    SubscriptionHandle, SubscriptionSignal, SubscriptionStats,
};
pub use transport::{NotificationSender, RawNotification, ServerItemId, SessionTransport};
