// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-process transport that simulates a server.
//!
//! Used by the binary (the wire stack is not part of this project) and by
//! tests, which drive it explicitly: make the endpoint unreachable, drop the
//! live connection, reject item creation for a node, or emit values.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use vigil_core::error::{SessionError, SessionResult};
use vigil_core::types::{NodeId, Value};

use super::transport::{NotificationSender, RawNotification, ServerItemId, SessionTransport};
use crate::types::Endpoint;

/// Simulated server transport.
pub struct SimulatedTransport {
    name: String,
    state: Mutex<SimState>,
    reachable: AtomicBool,
    protocol_failure: AtomicBool,
    connect_attempts: AtomicU64,
    item_creations: AtomicU64,
    item_deletions: AtomicU64,
    creation_delay_ms: AtomicU64,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    sender: Option<NotificationSender>,
    items: BTreeMap<ServerItemId, (NodeId, Duration)>,
    next_item: u32,
    rejected: HashSet<NodeId>,
    values: HashMap<NodeId, Value>,
}

impl SimulatedTransport {
    /// Creates a reachable simulated server.
    pub fn new() -> Self {
        Self::named("simulated")
    }

    /// Creates a reachable simulated server with a custom name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimState::default()),
            reachable: AtomicBool::new(true),
            protocol_failure: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            item_creations: AtomicU64::new(0),
            item_deletions: AtomicU64::new(0),
            creation_delay_ms: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Controls
    // =========================================================================

    /// Makes subsequent connection attempts succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes reads and writes return protocol errors.
    pub fn set_protocol_failure(&self, failing: bool) {
        self.protocol_failure.store(failing, Ordering::SeqCst);
    }

    /// Delays every monitored item creation by `delay`.
    pub fn set_item_creation_delay(&self, delay: Duration) {
        self.creation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the server reject monitored items for `node_id`.
    pub fn reject_node(&self, node_id: impl Into<NodeId>) {
        self.state.lock().rejected.insert(node_id.into());
    }

    /// Accepts monitored items for `node_id` again.
    pub fn accept_node(&self, node_id: &NodeId) {
        self.state.lock().rejected.remove(node_id);
    }

    /// Sets the value returned by reads.
    pub fn set_value(&self, node_id: impl Into<NodeId>, value: impl Into<Value>) {
        self.state.lock().values.insert(node_id.into(), value.into());
    }

    /// Drops the live connection as a network failure would.
    ///
    /// Server-side items are discarded. Returns `false` if not connected.
    pub fn drop_connection(&self) -> bool {
        let mut state = self.state.lock();
        let was_connected = state.connected;
        state.connected = false;
        state.sender = None;
        state.items.clear();
        was_connected
    }

    /// Reports a value change for `node_id` to every monitored item on it.
    ///
    /// Returns the number of items notified.
    pub async fn emit(
        &self,
        node_id: impl Into<NodeId>,
        value: impl Into<Value>,
        source_timestamp: DateTime<Utc>,
    ) -> usize {
        let node_id = node_id.into();
        let value = value.into();

        let (sender, items) = {
            let mut state = self.state.lock();
            state.values.insert(node_id.clone(), value.clone());
            let Some(sender) = state.sender.clone() else {
                return 0;
            };
            let items: Vec<ServerItemId> = state
                .items
                .iter()
                .filter(|(_, (node, _))| *node == node_id)
                .map(|(id, _)| *id)
                .collect();
            (sender, items)
        };

        let mut notified = 0;
        for item in items {
            let notification = RawNotification {
                item,
                value: value.clone(),
                source_timestamp,
            };
            if sender.send(notification).await.is_ok() {
                notified += 1;
            }
        }
        notified
    }

    /// Periodically emits a random walk for every monitored node.
    ///
    /// Abort the returned handle to stop.
    pub fn spawn_generator(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;

                let updates: Vec<(NodeId, Value)> = {
                    let state = transport.state.lock();
                    let mut rng = rand::thread_rng();
                    let nodes: HashSet<&NodeId> = state.items.values().map(|(n, _)| n).collect();
                    nodes
                        .into_iter()
                        .map(|node| {
                            let previous = state
                                .values
                                .get(node)
                                .and_then(Value::as_f64)
                                .unwrap_or(50.0);
                            let next = previous + rng.gen_range(-1.0..=1.0);
                            (node.clone(), Value::Float64(next))
                        })
                        .collect()
                };

                let now = Utc::now();
                for (node, value) in updates {
                    transport.emit(node, value, now).await;
                }
            }
        })
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Returns `true` if a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Returns the live monitored items.
    pub fn live_items(&self) -> Vec<(NodeId, Duration)> {
        self.state.lock().items.values().cloned().collect()
    }

    /// Number of connection attempts, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Number of monitored items created.
    pub fn item_creations(&self) -> u64 {
        self.item_creations.load(Ordering::Relaxed)
    }

    /// Number of monitored items deleted.
    pub fn item_deletions(&self) -> u64 {
        self.item_deletions.load(Ordering::Relaxed)
    }

    fn ensure_connected(state: &SimState) -> SessionResult<()> {
        if state.connected {
            Ok(())
        } else {
            Err(SessionError::connection("connection closed by peer"))
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionTransport for SimulatedTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        notifications: NotificationSender,
    ) -> SessionResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SessionError::connection(format!(
                "{} is unreachable",
                endpoint
            )));
        }

        let mut state = self.state.lock();
        state.connected = true;
        state.sender = Some(notifications);
        state.items.clear();
        Ok(())
    }

    async fn disconnect(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.sender = None;
        state.items.clear();
        Ok(())
    }

    async fn keep_alive(&self) -> SessionResult<()> {
        Self::ensure_connected(&self.state.lock())
    }

    async fn read(&self, node_id: &NodeId) -> SessionResult<Value> {
        let state = self.state.lock();
        Self::ensure_connected(&state)?;
        if self.protocol_failure.load(Ordering::SeqCst) {
            return Err(SessionError::protocol("malformed read response"));
        }
        Ok(state.values.get(node_id).cloned().unwrap_or_default())
    }

    async fn write(&self, node_id: &NodeId, value: &Value) -> SessionResult<()> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        if self.protocol_failure.load(Ordering::SeqCst) {
            return Err(SessionError::protocol("malformed write response"));
        }
        state.values.insert(node_id.clone(), value.clone());
        Ok(())
    }

    async fn create_monitored_item(
        &self,
        node_id: &NodeId,
        sampling_interval: Duration,
    ) -> SessionResult<ServerItemId> {
        let delay = self.creation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        if state.rejected.contains(node_id) {
            return Err(SessionError::invalid_argument(format!(
                "BadNodeIdUnknown: {}",
                node_id
            )));
        }

        state.next_item += 1;
        let id = ServerItemId(state.next_item);
        state.items.insert(id, (node_id.clone(), sampling_interval));
        self.item_creations.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn delete_monitored_item(&self, item: ServerItemId) -> SessionResult<()> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        if state.items.remove(&item).is_some() {
            self.item_deletions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_emit_reaches_monitored_items() {
        let transport = SimulatedTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let endpoint = Endpoint::new("opc.tcp://sim:4840");

        transport.connect(&endpoint, tx).await.unwrap();
        let node = NodeId::new("ns=2;s=Speed");
        let id = transport
            .create_monitored_item(&node, Duration::from_millis(100))
            .await
            .unwrap();

        let notified = transport.emit(node.clone(), 12.5f64, Utc::now()).await;
        assert_eq!(notified, 1);
        let raw = rx.recv().await.unwrap();
        assert_eq!(raw.item, id);
        assert_eq!(raw.value, Value::Float64(12.5));

        assert_eq!(transport.emit("ns=2;s=Other", 1i32, Utc::now()).await, 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_discards_items() {
        let transport = SimulatedTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        let endpoint = Endpoint::new("opc.tcp://sim:4840");

        transport.connect(&endpoint, tx).await.unwrap();
        transport
            .create_monitored_item(&NodeId::new("a"), Duration::from_millis(100))
            .await
            .unwrap();

        assert!(transport.drop_connection());
        assert!(transport.live_items().is_empty());
        assert!(transport.keep_alive().await.is_err());
        assert!(!transport.drop_connection());
    }

    #[tokio::test]
    async fn test_rejected_node() {
        let transport = SimulatedTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        transport
            .connect(&Endpoint::new("opc.tcp://sim:4840"), tx)
            .await
            .unwrap();

        transport.reject_node("ns=2;s=Missing");
        let error = transport
            .create_monitored_item(&NodeId::new("ns=2;s=Missing"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let transport = SimulatedTransport::new();
        transport.set_reachable(false);
        let (tx, _rx) = mpsc::channel(8);

        let error = transport
            .connect(&Endpoint::new("opc.tcp://sim:4840"), tx)
            .await
            .unwrap_err();
        assert!(error.is_transport_failure());
        assert_eq!(transport.connect_attempts(), 1);
    }
}
