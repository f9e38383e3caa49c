// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription engine.
//!
//! Tracks monitored items on top of a [`ServerSession`] and turns the
//! session's notifications into [`DataChangeEvent`]s.
//!
//! # Architecture
//!
//! ```text
//!   subscribe()/unsubscribe()            SessionEvent::Established(g)
//!            │                                      │
//!            ▼                                      ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SubscriptionEngine                        │
//! │   items keyed by (node, interval), refcounted, in subscribe  │
//! │   order; replayed against every new generation               │
//! └──────────────────────────────────────────────────────────────┘
//!            │ SessionNotification{generation, item, value}
//!            ▼
//!   stale generation / unknown item / out of order ──▶ discarded
//!            │
//!            ▼ DataChangeEvent
//!   ┌────────┴─────────┐
//!   ▼                  ▼
//! listeners        NotificationFanout ──▶ EventStream(s)
//! (historian)
//! ```
//!
//! Subscribing twice to the same node and interval creates one server-side
//! item; it is deleted when the last handle is released.
//!
//! Every event carries the sampling interval of the item that produced it.
//! Per item, consumers never see a value from generation `G` after one from
//! a later generation, and within a generation source timestamps never go
//! backwards.
//!
//! Transport calls run outside the dispatch table lock: notifications keep
//! flowing while items are created, deleted or replayed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use vigil_core::error::{SessionError, SessionResult};
use vigil_core::fanout::{
    ConsumerOptions, ConsumerReceiver, NotificationFanout, DEFAULT_CONSUMER_CAPACITY,
};
use vigil_core::serde_helpers::duration_millis;
use vigil_core::types::{DataChangeEvent, DataChangeListener, Generation, NodeId};

use super::session::{ServerSession, SessionEvent, SessionNotification};
use super::transport::ServerItemId;

// =============================================================================
// Configuration
// =============================================================================

/// Subscription engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Default queue capacity of live consumers.
    #[serde(default = "default_consumer_capacity")]
    pub consumer_capacity: usize,

    /// Capacity of the signal broadcast.
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
}

fn default_consumer_capacity() -> usize {
    DEFAULT_CONSUMER_CAPACITY
}

fn default_signal_capacity() -> usize {
    256
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            consumer_capacity: default_consumer_capacity(),
            signal_capacity: default_signal_capacity(),
        }
    }
}

impl SubscriptionConfig {
    /// Sets the default consumer capacity.
    pub fn with_consumer_capacity(mut self, capacity: usize) -> Self {
        self.consumer_capacity = capacity;
        self
    }
}

// =============================================================================
// Public types
// =============================================================================

/// Caller-side reference to a monitored item.
///
/// Release it with [`SubscriptionEngine::unsubscribe`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    node_id: NodeId,
    interval: Duration,
}

impl SubscriptionHandle {
    /// Handle identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribed node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sampling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Signals about item replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSignal {
    /// An item could not be recreated under a new generation.
    ///
    /// The item stays referenced and is retried on the next generation.
    ItemRecreationFailed {
        /// Affected node.
        node_id: NodeId,
        /// Generation the replay ran for.
        generation: Generation,
        /// Failure reason.
        message: String,
    },

    /// Replay for a generation finished.
    ReplayCompleted {
        /// Generation the replay ran for.
        generation: Generation,
        /// Items recreated.
        recreated: usize,
        /// Items that failed.
        failed: usize,
    },
}

/// State of a tracked item relative to the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Bound to the current connection.
    Active,
    /// Waiting for the next connection or replay.
    Pending,
    /// The last recreation attempt failed.
    Failed,
}

/// Tracked item description for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    /// Monitored node.
    pub node_id: NodeId,

    /// Sampling interval.
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,

    /// Number of live handles.
    pub refcount: usize,

    /// Generation the server-side item belongs to.
    pub generation: Option<Generation>,

    /// Current state.
    pub state: ItemState,

    /// Last recreation error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ItemKey {
    node_id: NodeId,
    interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemBinding {
    generation: Generation,
    server_id: ServerItemId,
}

#[derive(Debug)]
struct TrackedItem {
    order: u64,
    refcount: usize,
    binding: Option<ItemBinding>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct EngineState {
    items: HashMap<ItemKey, TrackedItem>,
    /// Subscribe order.
    order: BTreeMap<u64, ItemKey>,
    by_server: HashMap<(Generation, ServerItemId), ItemKey>,
    handles: HashMap<u64, ItemKey>,
    /// Last delivered (generation, timestamp) per item.
    watermarks: HashMap<ItemKey, (Generation, DateTime<Utc>)>,
    next_order: u64,
    /// Notifications that may belong to an item still being created.
    parked: Vec<SessionNotification>,
}

/// Upper bound of notifications held while items are being created.
const MAX_PARKED_NOTIFICATIONS: usize = 1024;

impl EngineState {
    fn bind(&mut self, key: &ItemKey, binding: ItemBinding) {
        if let Some(item) = self.items.get_mut(key) {
            if let Some(old) = item.binding.replace(binding) {
                self.by_server.remove(&(old.generation, old.server_id));
            }
            item.last_error = None;
            self.by_server
                .insert((binding.generation, binding.server_id), key.clone());
        }
    }

    fn issue_handle(&mut self, id: u64, key: ItemKey) -> SubscriptionHandle {
        self.handles.insert(id, key.clone());
        SubscriptionHandle {
            id,
            node_id: key.node_id,
            interval: key.interval,
        }
    }
}

/// Marks a server-side item creation as in flight until dropped.
struct CreationGuard<'a>(&'a AtomicUsize);

impl<'a> CreationGuard<'a> {
    fn new(creating: &'a AtomicUsize) -> Self {
        creating.fetch_add(1, Ordering::SeqCst);
        Self(creating)
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// SubscriptionEngine
// =============================================================================

/// Monitored item tracker and notification dispatcher for one session.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SubscriptionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    session: ServerSession,
    /// Dispatch table. Never held across a transport call.
    state: Mutex<EngineState>,
    /// Serializes subscribe, unsubscribe and replay.
    ops: Mutex<()>,
    /// Item creations waiting for the server.
    creating: AtomicUsize,
    fanout: Arc<NotificationFanout<DataChangeEvent>>,
    listeners: RwLock<Vec<Arc<dyn DataChangeListener>>>,
    signals: broadcast::Sender<SubscriptionSignal>,
    next_handle: AtomicU64,
    stats: SubscriptionStats,
    shutdown: Notify,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    replayer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    /// Creates an engine for `session` and starts its dispatch task.
    ///
    /// Each session feeds exactly one engine.
    pub fn new(session: ServerSession, config: SubscriptionConfig) -> SessionResult<Self> {
        let notifications = session.take_notifications().ok_or_else(|| {
            SessionError::invalid_state(
                session.state(),
                "session notifications are already consumed by another engine",
            )
        })?;
        let events = session.subscribe_events();
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));

        let inner = Arc::new(EngineInner {
            session,
            state: Mutex::new(EngineState::default()),
            ops: Mutex::new(()),
            creating: AtomicUsize::new(0),
            fanout: Arc::new(NotificationFanout::new(config.consumer_capacity)),
            listeners: RwLock::new(Vec::new()),
            signals,
            next_handle: AtomicU64::new(1),
            stats: SubscriptionStats::new(),
            shutdown: Notify::new(),
            pump: parking_lot::Mutex::new(None),
            replayer: parking_lot::Mutex::new(None),
        });

        let (replays, replay_requests) = watch::channel(0);
        let pump = tokio::spawn(run_pump(inner.clone(), notifications, events, replays));
        let replayer = tokio::spawn(run_replays(inner.clone(), replay_requests));
        *inner.pump.lock() = Some(pump);
        *inner.replayer.lock() = Some(replayer);

        Ok(Self { inner })
    }

    /// Returns the session this engine runs on.
    pub fn session(&self) -> &ServerSession {
        &self.inner.session
    }

    /// Returns the live fan-out.
    pub fn fanout(&self) -> &Arc<NotificationFanout<DataChangeEvent>> {
        &self.inner.fanout
    }

    /// Returns subscription statistics.
    pub fn stats(&self) -> &SubscriptionStats {
        &self.inner.stats
    }

    /// Subscribes to replay signals.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<SubscriptionSignal> {
        self.inner.signals.subscribe()
    }

    /// Adds a listener called for every dispatched event.
    ///
    /// Listeners run on the dispatch task and must not block.
    pub fn add_listener(&self, listener: Arc<dyn DataChangeListener>) {
        tracing::debug!(listener = listener.name(), "Listener added");
        self.inner.listeners.write().push(listener);
    }

    /// Removes listeners by name. Returns `true` if one was removed.
    pub fn remove_listener(&self, name: &str) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        before != listeners.len()
    }

    // =========================================================================
    // Subscribe / Unsubscribe
    // =========================================================================

    /// Subscribes to `node_id` at `interval`.
    ///
    /// An existing item with the same node and interval is shared and its
    /// reference count incremented. Creating a new item requires a connected
    /// session.
    pub async fn subscribe(
        &self,
        node_id: impl Into<NodeId>,
        interval: Duration,
    ) -> SessionResult<SubscriptionHandle> {
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(SessionError::invalid_argument("node id must not be empty"));
        }
        if interval.is_zero() {
            return Err(SessionError::invalid_argument(
                "sampling interval must be greater than zero",
            ));
        }

        let key = ItemKey {
            node_id: node_id.clone(),
            interval,
        };

        let _ops = self.inner.ops.lock().await;

        {
            let mut state = self.inner.state.lock().await;
            if let Some(item) = state.items.get_mut(&key) {
                item.refcount += 1;
                tracing::trace!(node_id = %node_id, refcount = item.refcount, "Item shared");
                let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
                return Ok(state.issue_handle(id, key));
            }
        }

        let creation = CreationGuard::new(&self.inner.creating);
        let created = self
            .inner
            .session
            .create_monitored_item(&node_id, interval)
            .await;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let (generation, server_id) = match created {
            Ok(created) => created,
            Err(error) => {
                drop(creation);
                self.inner.route_parked(state);
                return Err(error);
            }
        };

        let order = state.next_order;
        state.next_order += 1;
        state.order.insert(order, key.clone());
        state.items.insert(
            key.clone(),
            TrackedItem {
                order,
                refcount: 1,
                binding: None,
                last_error: None,
            },
        );
        state.bind(
            &key,
            ItemBinding {
                generation,
                server_id,
            },
        );
        drop(creation);
        self.inner.route_parked(state);
        self.inner.stats.record_created();

        tracing::debug!(
            node_id = %node_id,
            interval_ms = interval.as_millis() as u64,
            generation,
            server_id = %server_id,
            "Monitored item created"
        );

        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(state.issue_handle(id, key))
    }

    /// Subscribes to several nodes at the same interval.
    ///
    /// All or nothing: on failure the handles acquired so far are released.
    pub async fn subscribe_many<I, N>(
        &self,
        node_ids: I,
        interval: Duration,
    ) -> SessionResult<Vec<SubscriptionHandle>>
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let mut handles = Vec::new();
        for node_id in node_ids {
            match self.subscribe(node_id, interval).await {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    self.release(handles).await;
                    return Err(error);
                }
            }
        }
        Ok(handles)
    }

    /// Releases a handle. The server-side item is deleted with the last one.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> SessionResult<()> {
        let _ops = self.inner.ops.lock().await;

        let (key, binding) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let Some(key) = state.handles.remove(&handle.id) else {
                return Err(SessionError::invalid_argument(format!(
                    "unknown subscription handle {}",
                    handle.id
                )));
            };

            let remaining = match state.items.get_mut(&key) {
                Some(item) => {
                    item.refcount = item.refcount.saturating_sub(1);
                    item.refcount
                }
                None => return Ok(()),
            };
            if remaining > 0 {
                return Ok(());
            }

            let Some(item) = state.items.remove(&key) else {
                return Ok(());
            };
            state.order.remove(&item.order);
            state.watermarks.remove(&key);
            if let Some(binding) = item.binding {
                state
                    .by_server
                    .remove(&(binding.generation, binding.server_id));
            }
            (key, item.binding)
        };

        // Unbound above, so nothing more is dispatched for the item.
        if let Some(binding) = binding {
            match self
                .inner
                .session
                .delete_monitored_item(binding.generation, binding.server_id)
                .await
            {
                Ok(true) => self.inner.stats.record_deleted(),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        node_id = %key.node_id,
                        error = %error,
                        "Failed to delete monitored item"
                    );
                }
            }
        }

        tracing::debug!(node_id = %key.node_id, "Monitored item released");
        Ok(())
    }

    async fn release(&self, handles: Vec<SubscriptionHandle>) {
        for handle in handles {
            if let Err(error) = self.unsubscribe(handle).await {
                tracing::debug!(error = %error, "Handle already released");
            }
        }
    }

    /// Subscribes to `node_ids` and returns a live stream of their events.
    ///
    /// `capacity` bounds the stream's queue; when it is full the oldest event
    /// is dropped and counted as an overrun.
    pub async fn stream<I, N>(
        &self,
        node_ids: I,
        interval: Duration,
        capacity: usize,
    ) -> SessionResult<EventStream>
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let nodes: Vec<NodeId> = node_ids.into_iter().map(Into::into).collect();
        if nodes.is_empty() {
            return Err(SessionError::invalid_argument("stream needs at least one node"));
        }

        let filter_nodes = nodes.clone();
        let receiver = self.inner.fanout.register(
            ConsumerOptions::new(format!("stream[{}]", nodes.len()))
                .capacity(capacity)
                .filter(move |event: &DataChangeEvent| {
                    filter_nodes.iter().any(|node| event.is_from(node, interval))
                }),
        );

        match self.subscribe_many(nodes.iter().cloned(), interval).await {
            Ok(handles) => Ok(EventStream {
                engine: self.clone(),
                receiver,
                handles,
                nodes,
            }),
            Err(error) => {
                self.inner.fanout.deregister(receiver.id());
                Err(error)
            }
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Lists tracked items in subscribe order.
    pub async fn items(&self) -> Vec<ItemInfo> {
        let current = self.inner.session.generation();
        let connected = self.inner.session.is_connected();
        let state = self.inner.state.lock().await;

        state
            .order
            .values()
            .filter_map(|key| state.items.get(key).map(|item| (key, item)))
            .map(|(key, item)| {
                let generation = item.binding.map(|b| b.generation);
                let item_state = if item.last_error.is_some() {
                    ItemState::Failed
                } else if connected && generation == Some(current) {
                    ItemState::Active
                } else {
                    ItemState::Pending
                };
                ItemInfo {
                    node_id: key.node_id.clone(),
                    interval: key.interval,
                    refcount: item.refcount,
                    generation,
                    state: item_state,
                    last_error: item.last_error.clone(),
                }
            })
            .collect()
    }

    /// Stops the dispatch task and closes all live streams.
    pub async fn shutdown(&self) {
        self.inner.shutdown.notify_one();
        let handle = self.inner.pump.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let replayer = self.inner.replayer.lock().take();
        if let Some(replayer) = replayer {
            replayer.abort();
            let _ = replayer.await;
        }
        self.inner.fanout.close_all();
        tracing::debug!("Subscription engine stopped");
    }
}

// =============================================================================
// EngineInner: dispatch and replay
// =============================================================================

impl EngineInner {
    async fn dispatch(&self, notification: SessionNotification) {
        let mut guard = self.state.lock().await;
        self.route(&mut guard, notification);
    }

    fn route(&self, state: &mut EngineState, notification: SessionNotification) {
        let current = self.session.generation();
        if notification.generation < current {
            self.stats.record_stale();
            tracing::debug!(
                generation = notification.generation,
                current,
                "Stale notification discarded"
            );
            return;
        }

        let Some(key) = state
            .by_server
            .get(&(notification.generation, notification.item))
            .cloned()
        else {
            if self.creating.load(Ordering::SeqCst) > 0
                && state.parked.len() < MAX_PARKED_NOTIFICATIONS
            {
                state.parked.push(notification);
            } else {
                self.stats.record_unknown();
                tracing::trace!(item = %notification.item, "Notification for unknown item discarded");
            }
            return;
        };

        if let Some(&(generation, timestamp)) = state.watermarks.get(&key) {
            if notification.generation < generation {
                self.stats.record_stale();
                return;
            }
            if notification.generation == generation && notification.source_timestamp < timestamp {
                self.stats.record_out_of_order();
                tracing::debug!(node_id = %key.node_id, "Out-of-order notification discarded");
                return;
            }
        }
        state.watermarks.insert(
            key.clone(),
            (notification.generation, notification.source_timestamp),
        );

        let event = DataChangeEvent::new(
            key.node_id,
            notification.value,
            notification.source_timestamp,
            notification.generation,
        )
        .with_sampling_interval(key.interval);

        // Delivered under the state lock so that nothing is dispatched for an
        // item after its last handle was released.
        let listeners: Vec<Arc<dyn DataChangeListener>> = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_data_change(&event);
        }
        self.fanout.publish(&event);
        self.stats.record_dispatched();
    }

    /// Routes notifications parked while an item was being created.
    fn route_parked(&self, state: &mut EngineState) {
        for notification in std::mem::take(&mut state.parked) {
            self.route(state, notification);
        }
    }

    async fn replay(&self, generation: Generation) {
        let _ops = self.ops.lock().await;

        if self.session.generation() != generation {
            tracing::debug!(generation, "Skipping replay for superseded generation");
            return;
        }

        let keys: Vec<ItemKey> = {
            let state = self.state.lock().await;
            state
                .order
                .values()
                .filter(|key| {
                    state.items.get(*key).map_or(false, |item| {
                        item.binding.map_or(true, |b| b.generation != generation)
                    })
                })
                .cloned()
                .collect()
        };
        let mut recreated = 0usize;
        let mut failed = 0usize;

        for key in keys {
            let creation = CreationGuard::new(&self.creating);
            let created = self
                .session
                .create_monitored_item(&key.node_id, key.interval)
                .await;

            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match created {
                Ok((bound_generation, server_id)) => {
                    state.bind(
                        &key,
                        ItemBinding {
                            generation: bound_generation,
                            server_id,
                        },
                    );
                    recreated += 1;
                    self.stats.record_recreated();
                    tracing::debug!(
                        node_id = %key.node_id,
                        generation = bound_generation,
                        server_id = %server_id,
                        "Monitored item recreated"
                    );
                }
                Err(error) => {
                    let message = error.to_string();
                    if let Some(item) = state.items.get_mut(&key) {
                        item.last_error = Some(message.clone());
                    }
                    failed += 1;
                    self.stats.record_recreation_failure();

                    let error = SessionError::item_recreation_failed(key.node_id.clone(), message.clone());
                    tracing::warn!(generation, error = %error, "Item recreation failed");
                    let _ = self.signals.send(SubscriptionSignal::ItemRecreationFailed {
                        node_id: key.node_id.clone(),
                        generation,
                        message,
                    });
                }
            }
            drop(creation);
            self.route_parked(state);
        }

        self.stats.record_replay();
        tracing::info!(generation, recreated, failed, "Monitored items replayed");
        let _ = self.signals.send(SubscriptionSignal::ReplayCompleted {
            generation,
            recreated,
            failed,
        });
    }
}

async fn run_pump(
    inner: Arc<EngineInner>,
    mut notifications: mpsc::Receiver<SessionNotification>,
    mut events: broadcast::Receiver<SessionEvent>,
    replays: watch::Sender<Generation>,
) {
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Established { generation }) => {
                    let _ = replays.send(generation);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session events lagged, checking items");
                    if inner.session.is_connected() {
                        let _ = replays.send(inner.session.generation());
                    }
                }
                Err(RecvError::Closed) => break,
            },
            notification = notifications.recv() => match notification {
                Some(notification) => inner.dispatch(notification).await,
                None => break,
            },
        }
    }
    tracing::trace!("Subscription pump finished");
}

/// Replays items for the latest established generation.
///
/// Runs beside the pump so that dispatch continues while items are
/// recreated. Generations superseded before their turn are skipped.
async fn run_replays(inner: Arc<EngineInner>, mut requests: watch::Receiver<Generation>) {
    while requests.changed().await.is_ok() {
        let generation = *requests.borrow_and_update();
        inner.replay(generation).await;
    }
    tracing::trace!("Replay worker finished");
}

// =============================================================================
// EventStream
// =============================================================================

/// Live, cancellable sequence of events for a set of nodes.
///
/// [`EventStream::close`] releases the subscriptions. Dropping the stream
/// releases them in the background.
pub struct EventStream {
    engine: SubscriptionEngine,
    receiver: ConsumerReceiver<DataChangeEvent>,
    handles: Vec<SubscriptionHandle>,
    nodes: Vec<NodeId>,
}

impl EventStream {
    /// Waits for the next event. `None` once the engine shut down.
    pub async fn next(&mut self) -> Option<DataChangeEvent> {
        self.receiver.recv().await
    }

    /// Returns the next event without waiting.
    pub fn try_next(&mut self) -> Option<DataChangeEvent> {
        self.receiver.try_recv()
    }

    /// Events dropped because this stream fell behind.
    pub fn overruns(&self) -> u64 {
        self.receiver.overruns()
    }

    /// Nodes covered by this stream.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Stops delivery and releases the subscriptions.
    pub async fn close(mut self) {
        self.engine.inner.fanout.deregister(self.receiver.id());
        let handles = std::mem::take(&mut self.handles);
        self.engine.release(handles).await;
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.engine.inner.fanout.deregister(self.receiver.id());
        let handles = std::mem::take(&mut self.handles);
        let engine = self.engine.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { engine.release(handles).await });
        }
    }
}

// =============================================================================
// SubscriptionStats
// =============================================================================

/// Statistics for the subscription engine.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    items_created: AtomicU64,
    items_deleted: AtomicU64,
    items_recreated: AtomicU64,
    recreation_failures: AtomicU64,
    replays: AtomicU64,
    dispatched: AtomicU64,
    stale_discarded: AtomicU64,
    unknown_discarded: AtomicU64,
    out_of_order_discarded: AtomicU64,
}

impl SubscriptionStats {
    /// Creates new statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_created(&self) {
        self.items_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_deleted(&self) {
        self.items_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_recreated(&self) {
        self.items_recreated.fetch_add(1, Ordering::Relaxed);
    }

    fn record_recreation_failure(&self) {
        self.recreation_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stale(&self) {
        self.stale_discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unknown(&self) {
        self.unknown_discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_out_of_order(&self) {
        self.out_of_order_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Server-side items created by `subscribe`.
    pub fn items_created(&self) -> u64 {
        self.items_created.load(Ordering::Relaxed)
    }

    /// Server-side items deleted by `unsubscribe`.
    pub fn items_deleted(&self) -> u64 {
        self.items_deleted.load(Ordering::Relaxed)
    }

    /// Items recreated during replay.
    pub fn items_recreated(&self) -> u64 {
        self.items_recreated.load(Ordering::Relaxed)
    }

    /// Items that failed to be recreated.
    pub fn recreation_failures(&self) -> u64 {
        self.recreation_failures.load(Ordering::Relaxed)
    }

    /// Completed replays.
    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }

    /// Events dispatched.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Notifications dropped for carrying a stale generation.
    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded.load(Ordering::Relaxed)
    }

    /// Notifications dropped for an unknown item.
    pub fn unknown_discarded(&self) -> u64 {
        self.unknown_discarded.load(Ordering::Relaxed)
    }

    /// Notifications dropped for going back in time.
    pub fn out_of_order_discarded(&self) -> u64 {
        self.out_of_order_discarded.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::session::SessionConfig;
    use crate::client::simulated::SimulatedTransport;
    use crate::types::Endpoint;
    use chrono::TimeZone;
    use vigil_core::types::Value;

    const WAIT: Duration = Duration::from_secs(3);

    async fn setup() -> (Arc<SimulatedTransport>, ServerSession, SubscriptionEngine) {
        let transport = Arc::new(SimulatedTransport::new());
        let session = ServerSession::new(
            Endpoint::new("opc.tcp://sim:4840"),
            transport.clone(),
            SessionConfig::for_testing(),
        )
        .unwrap();
        let engine = SubscriptionEngine::new(session.clone(), SubscriptionConfig::default()).unwrap();
        session.connect().await.unwrap();
        (transport, session, engine)
    }

    async fn replay_for(
        signals: &mut broadcast::Receiver<SubscriptionSignal>,
        generation: Generation,
    ) -> (usize, usize, Vec<NodeId>) {
        let mut failed_nodes = Vec::new();
        loop {
            let signal = tokio::time::timeout(WAIT, signals.recv())
                .await
                .expect("replay signal")
                .unwrap();
            match signal {
                SubscriptionSignal::ItemRecreationFailed {
                    node_id,
                    generation: g,
                    ..
                } if g == generation => failed_nodes.push(node_id),
                SubscriptionSignal::ReplayCompleted {
                    generation: g,
                    recreated,
                    failed,
                } if g == generation => return (recreated, failed, failed_nodes),
                _ => {}
            }
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_is_refcounted() {
        let (transport, session, engine) = setup().await;
        let interval = Duration::from_millis(1000);

        let first = engine.subscribe("ns=2;s=Speed", interval).await.unwrap();
        let second = engine.subscribe("ns=2;s=Speed", interval).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(transport.item_creations(), 1);

        let items = engine.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].refcount, 2);
        assert_eq!(items[0].state, ItemState::Active);

        engine.unsubscribe(first).await.unwrap();
        assert_eq!(transport.item_deletions(), 0);
        engine.unsubscribe(second).await.unwrap();
        assert_eq!(transport.item_deletions(), 1);
        assert!(engine.items().await.is_empty());

        // A different interval is a different item.
        let fast = engine.subscribe("ns=2;s=Speed", Duration::from_millis(100)).await.unwrap();
        let slow = engine.subscribe("ns=2;s=Speed", interval).await.unwrap();
        assert_eq!(transport.item_creations(), 3);
        engine.unsubscribe(fast).await.unwrap();
        engine.unsubscribe(slow).await.unwrap();

        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = Arc::new(SimulatedTransport::new());
        let session = ServerSession::new(
            Endpoint::new("opc.tcp://sim:4840"),
            transport,
            SessionConfig::for_testing(),
        )
        .unwrap();
        let engine = SubscriptionEngine::new(session.clone(), SubscriptionConfig::default()).unwrap();

        let error = engine
            .subscribe("ns=2;s=Speed", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::NotConnected { .. }));

        let error = engine.subscribe("", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(error, SessionError::InvalidArgument { .. }));

        // Only one engine per session.
        assert!(SubscriptionEngine::new(session, SubscriptionConfig::default()).is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_delivers_only_its_nodes() {
        let (transport, session, engine) = setup().await;

        let mut stream = engine
            .stream(["ns=2;s=Speed"], Duration::from_millis(100), 16)
            .await
            .unwrap();
        let other = engine
            .subscribe("ns=2;s=Temp", Duration::from_millis(100))
            .await
            .unwrap();

        transport.emit("ns=2;s=Temp", 20.0f64, at(0)).await;
        transport.emit("ns=2;s=Speed", 12.5f64, at(1)).await;

        let event = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(event.node_id, NodeId::new("ns=2;s=Speed"));
        assert_eq!(event.value, Value::Float64(12.5));
        assert_eq!(event.generation, 1);
        assert!(stream.try_next().is_none());

        stream.close().await;
        assert_eq!(transport.item_deletions(), 1);

        engine.unsubscribe(other).await.unwrap();
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_replay_after_reconnect_keeps_subscribe_order() {
        let (transport, session, engine) = setup().await;
        let mut signals = engine.subscribe_signals();
        let interval = Duration::from_millis(500);

        let _a = engine.subscribe("ns=2;s=A", interval).await.unwrap();
        let _b = engine.subscribe("ns=2;s=B", interval).await.unwrap();
        let _c = engine.subscribe("ns=2;s=C", interval).await.unwrap();

        transport.drop_connection();
        let (recreated, failed, _) = replay_for(&mut signals, 2).await;
        assert_eq!((recreated, failed), (3, 0));

        let live: Vec<NodeId> = transport.live_items().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            live,
            vec![NodeId::new("ns=2;s=A"), NodeId::new("ns=2;s=B"), NodeId::new("ns=2;s=C")]
        );
        assert!(engine
            .items()
            .await
            .iter()
            .all(|item| item.generation == Some(2) && item.state == ItemState::Active));

        let mut stream = engine.stream(["ns=2;s=B"], interval, 8).await.unwrap();
        transport.emit("ns=2;s=B", 7i32, at(5)).await;
        let event = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(event.generation, 2);

        stream.close().await;
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_item_recreation_failure_is_reported() {
        let (transport, session, engine) = setup().await;
        let mut signals = engine.subscribe_signals();
        let interval = Duration::from_millis(500);

        let _ok = engine.subscribe("ns=2;s=Good", interval).await.unwrap();
        let _bad = engine.subscribe("ns=2;s=Removed", interval).await.unwrap();

        transport.reject_node("ns=2;s=Removed");
        transport.drop_connection();

        let (recreated, failed, failed_nodes) = replay_for(&mut signals, 2).await;
        assert_eq!((recreated, failed), (1, 1));
        assert_eq!(failed_nodes, vec![NodeId::new("ns=2;s=Removed")]);

        let items = engine.items().await;
        assert_eq!(items[0].state, ItemState::Active);
        assert_eq!(items[1].state, ItemState::Failed);
        assert!(items[1].last_error.is_some());
        assert!(session.is_connected());

        // Retried on the next generation.
        transport.accept_node(&NodeId::new("ns=2;s=Removed"));
        transport.drop_connection();
        let (recreated, failed, _) = replay_for(&mut signals, 3).await;
        assert_eq!((recreated, failed), (2, 0));

        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let (transport, session, engine) = setup().await;
        let mut signals = engine.subscribe_signals();

        let handle = engine
            .subscribe("ns=2;s=Level", Duration::from_millis(200))
            .await
            .unwrap();
        let mut stream = engine.stream(["ns=2;s=Level"], Duration::from_millis(200), 8).await.unwrap();

        transport.drop_connection();
        replay_for(&mut signals, 2).await;

        // A notification from the first connection arriving late.
        engine
            .inner
            .dispatch(SessionNotification {
                generation: 1,
                item: ServerItemId(1),
                value: Value::Float64(99.0),
                source_timestamp: at(100),
            })
            .await;
        assert_eq!(engine.stats().stale_discarded(), 1);
        assert!(stream.try_next().is_none());

        transport.emit("ns=2;s=Level", 1.0f64, at(1)).await;
        let event = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(event.generation, 2);

        stream.close().await;
        engine.unsubscribe(handle).await.unwrap();
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_out_of_order_is_discarded() {
        let (transport, session, engine) = setup().await;
        let mut stream = engine
            .stream(["ns=2;s=Flow"], Duration::from_millis(200), 8)
            .await
            .unwrap();

        transport.emit("ns=2;s=Flow", 1.0f64, at(10)).await;
        transport.emit("ns=2;s=Flow", 2.0f64, at(5)).await;
        transport.emit("ns=2;s=Flow", 3.0f64, at(10)).await;

        let first = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        let second = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(first.value, Value::Float64(1.0));
        assert_eq!(second.value, Value::Float64(3.0));
        assert_eq!(engine.stats().out_of_order_discarded(), 1);

        stream.close().await;
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_handle_is_rejected() {
        let (_transport, session, engine) = setup().await;
        let handle = engine
            .subscribe("ns=2;s=X", Duration::from_millis(100))
            .await
            .unwrap();
        let forged = SubscriptionHandle {
            id: handle.id() + 100,
            node_id: NodeId::new("ns=2;s=X"),
            interval: Duration::from_millis(100),
        };

        assert!(engine.unsubscribe(forged).await.is_err());
        engine.unsubscribe(handle).await.unwrap();
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_events_carry_their_item_interval() {
        let (transport, session, engine) = setup().await;
        let fast = Duration::from_millis(100);
        let slow = Duration::from_millis(1000);

        let mut fast_stream = engine.stream(["ns=2;s=Speed"], fast, 8).await.unwrap();
        let mut slow_stream = engine.stream(["ns=2;s=Speed"], slow, 8).await.unwrap();
        assert_eq!(transport.live_items().len(), 2);

        // One value change, one notification per server-side item.
        transport.emit("ns=2;s=Speed", 10i32, at(0)).await;

        let event = tokio::time::timeout(WAIT, fast_stream.next()).await.unwrap().unwrap();
        assert_eq!(event.sampling_interval, fast);
        let event = tokio::time::timeout(WAIT, slow_stream.next()).await.unwrap().unwrap();
        assert_eq!(event.sampling_interval, slow);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fast_stream.try_next().is_none());
        assert!(slow_stream.try_next().is_none());
        assert_eq!(engine.stats().dispatched(), 2);

        fast_stream.close().await;
        slow_stream.close().await;
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_dispatch_continues_while_item_is_created() {
        let (transport, session, engine) = setup().await;
        let interval = Duration::from_millis(100);
        let mut stream = engine.stream(["ns=2;s=Speed"], interval, 8).await.unwrap();

        transport.set_item_creation_delay(Duration::from_millis(150));
        let subscriber = engine.clone();
        let pending = tokio::spawn(async move { subscriber.subscribe("ns=2;s=Temp", interval).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.emit("ns=2;s=Speed", 1.0f64, at(0)).await;
        let event = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .expect("event delivered while the item was being created")
            .unwrap();
        assert_eq!(event.value, Value::Float64(1.0));
        assert!(!pending.is_finished());

        let handle = pending.await.unwrap().unwrap();
        assert_eq!(handle.node_id(), &NodeId::new("ns=2;s=Temp"));
        assert_eq!(engine.items().await.len(), 2);

        transport.set_item_creation_delay(Duration::ZERO);
        engine.unsubscribe(handle).await.unwrap();
        stream.close().await;
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_notifications_wait_for_items_being_created() {
        let (_transport, session, engine) = setup().await;
        let notification = SessionNotification {
            generation: 1,
            item: ServerItemId(99),
            value: Value::Int32(5),
            source_timestamp: at(0),
        };

        let creation = CreationGuard::new(&engine.inner.creating);
        engine.inner.dispatch(notification).await;
        assert_eq!(engine.stats().unknown_discarded(), 0);
        assert_eq!(engine.inner.state.lock().await.parked.len(), 1);

        // The creation finished without producing the item.
        drop(creation);
        {
            let mut state = engine.inner.state.lock().await;
            engine.inner.route_parked(&mut state);
            assert!(state.parked.is_empty());
        }
        assert_eq!(engine.stats().unknown_discarded(), 1);

        engine.shutdown().await;
        session.disconnect().await;
    }
}
