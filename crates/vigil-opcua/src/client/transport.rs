// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transport abstraction layer.
//!
//! The protocol stack (binary framing, secure channel handshake, certificate
//! validation) lives behind [`SessionTransport`]. The session state machine
//! only needs connect/disconnect/read/write and monitored item primitives.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use vigil_core::error::SessionResult;
use vigil_core::types::{NodeId, Value};

use crate::types::Endpoint;

// =============================================================================
// ServerItemId
// =============================================================================

/// Server-assigned identifier of a monitored item.
///
/// Only meaningful within the connection that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerItemId(pub u32);

impl fmt::Display for ServerItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

// =============================================================================
// RawNotification
// =============================================================================

/// A data change reported by the transport for one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    /// The item that changed.
    pub item: ServerItemId,

    /// New value.
    pub value: Value,

    /// Source timestamp reported by the server.
    pub source_timestamp: DateTime<Utc>,
}

/// Channel on which a connected transport reports notifications.
///
/// A fresh channel is handed to every `connect` call; the transport drops it
/// when the connection ends.
pub type NotificationSender = mpsc::Sender<RawNotification>;

// =============================================================================
// SessionTransport Trait
// =============================================================================

/// Abstract transport to one remote server.
///
/// Implementations must be `Send + Sync`; the session calls them from its
/// supervisor task and from callers concurrently.
///
/// Errors for which [`SessionError::is_transport_failure`] is `true` are
/// treated as a lost connection. `Protocol` errors abort the current
/// operation only.
///
/// [`SessionError::is_transport_failure`]: vigil_core::error::SessionError::is_transport_failure
#[async_trait]
pub trait SessionTransport: Send + Sync {
    // =========================================================================
    // Connection Management
    // =========================================================================

    /// Opens a connection to `endpoint`.
    ///
    /// Notifications for monitored items created on this connection must be
    /// sent on `notifications`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        notifications: NotificationSender,
    ) -> SessionResult<()>;

    /// Closes the connection. Must succeed when already closed.
    async fn disconnect(&self) -> SessionResult<()>;

    /// Probes the connection.
    async fn keep_alive(&self) -> SessionResult<()>;

    // =========================================================================
    // Read / Write
    // =========================================================================

    /// Reads the current value of a node.
    async fn read(&self, node_id: &NodeId) -> SessionResult<Value>;

    /// Writes a value to a node.
    async fn write(&self, node_id: &NodeId, value: &Value) -> SessionResult<()>;

    // =========================================================================
    // Monitored Items
    // =========================================================================

    /// Creates a monitored item on the current connection.
    async fn create_monitored_item(
        &self,
        node_id: &NodeId,
        sampling_interval: Duration,
    ) -> SessionResult<ServerItemId>;

    /// Deletes a monitored item on the current connection.
    async fn delete_monitored_item(&self, item: ServerItemId) -> SessionResult<()>;

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Returns the transport name for logging.
    fn name(&self) -> &str;
}
