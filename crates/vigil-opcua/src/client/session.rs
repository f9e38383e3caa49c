// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server session state machine.
//!
//! A [`ServerSession`] owns one logical connection to one [`Endpoint`]. The
//! owner may only request `connect` and `disconnect`; every other transition
//! is driven by transport outcomes and handled by a supervisor task that
//! probes the connection and reconnects with backoff.
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────▶ Connecting ──── transport up ────┐
//!       ▲                          │                            ▼
//!       │                    transport down                 Connected ◀─┐
//!       │ disconnect()             ▼                            │       │
//!       │ (from any state)   Reconnecting ◀── transport down ───┘       │
//!       │                     │        └──────── transport up ──────────┘
//!       │                     │ retries exhausted (bounded policy only)
//!       │                     ▼
//!       └──────────────────  Failed
//! ```
//!
//! Every successful (re)connect increments the session `generation` and
//! broadcasts [`SessionEvent::Established`]. Notifications forwarded to the
//! subscription engine are tagged with the generation of the connection that
//! produced them.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;
use vigil_core::error::{SessionError, SessionResult};
use vigil_core::retry::{Backoff, RetryPolicy};
use vigil_core::serde_helpers::duration_millis;
use vigil_core::types::{Generation, NodeId, Value};

use super::transport::{RawNotification, ServerItemId, SessionTransport};
use crate::types::Endpoint;

// =============================================================================
// SessionState
// =============================================================================

/// State of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not connected. Initial state and the state after `disconnect()`.
    #[default]
    Disconnected,

    /// First connection attempt in progress.
    Connecting,

    /// Connected and usable.
    Connected,

    /// Connection lost; retrying in the background.
    Reconnecting,

    /// The retry policy gave up.
    Failed,
}

impl SessionState {
    /// Returns `true` if the session is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` if a connection attempt is pending.
    #[inline]
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Returns `true` if the session has failed.
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Applies `input` and returns the next state.
    ///
    /// This is the complete transition table; the session never changes
    /// state any other way.
    pub fn apply(self, input: SessionInput) -> Result<SessionState, InvalidTransition> {
        use SessionInput as I;
        use SessionState as S;

        match (self, input) {
            (_, I::Disconnect) => Ok(S::Disconnected),
            (S::Disconnected, I::Connect) => Ok(S::Connecting),
            (S::Connecting | S::Reconnecting, I::TransportUp) => Ok(S::Connected),
            (S::Connecting | S::Connected | S::Reconnecting, I::TransportDown) => {
                Ok(S::Reconnecting)
            }
            (S::Reconnecting, I::RetriesExhausted) => Ok(S::Failed),
            (from, input) => Err(InvalidTransition { from, input }),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Input to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionInput {
    /// Owner requested a connection.
    Connect,
    /// The transport connected.
    TransportUp,
    /// A connection attempt failed or the live connection dropped.
    TransportDown,
    /// The retry policy has no attempts left.
    RetriesExhausted,
    /// Owner requested a disconnect.
    Disconnect,
}

impl fmt::Display for SessionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::TransportUp => write!(f, "transport_up"),
            Self::TransportDown => write!(f, "transport_down"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// An input that is not accepted in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("'{input}' is not allowed in state {from}")]
pub struct InvalidTransition {
    /// State the session was in.
    pub from: SessionState,
    /// Rejected input.
    pub input: SessionInput,
}

impl From<InvalidTransition> for SessionError {
    fn from(e: InvalidTransition) -> Self {
        SessionError::invalid_state(e.from, format!("'{}' is not allowed", e.input))
    }
}

// =============================================================================
// SessionEvent
// =============================================================================

/// Lifecycle events broadcast by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The state changed.
    StateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },

    /// A (re)connect succeeded. Server-side items must be recreated.
    Established {
        /// Generation of the new connection.
        generation: Generation,
    },

    /// The live connection was lost.
    Lost {
        /// Generation of the lost connection.
        generation: Generation,
        /// Why the connection was considered lost.
        reason: String,
    },

    /// Reconnection was abandoned.
    Failed {
        /// Number of retries made.
        attempts: u32,
    },

    /// The owner disconnected the session.
    Closed,
}

/// A transport notification tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotification {
    /// Generation of the connection that delivered the notification.
    pub generation: Generation,

    /// The server-side item.
    pub item: ServerItemId,

    /// New value.
    pub value: Value,

    /// Source timestamp.
    pub source_timestamp: DateTime<Utc>,
}

impl SessionNotification {
    fn tag(generation: Generation, raw: RawNotification) -> Self {
        Self {
            generation,
            item: raw.item,
            value: raw.value,
            source_timestamp: raw.source_timestamp,
        }
    }
}

/// Point-in-time view of a session for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Session identifier.
    pub session_id: String,

    /// Endpoint URL.
    pub endpoint: String,

    /// Current state.
    pub state: SessionState,

    /// Current generation (0 before the first connection).
    pub generation: Generation,

    /// Retries made since the connection was lost.
    pub reconnect_attempts: u32,

    /// Last connection error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// =============================================================================
// SessionConfig
// =============================================================================

/// Session timing and capacity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Timeout of one connection attempt.
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Timeout of a read, write, item operation or keep-alive probe.
    #[serde(default = "default_request_timeout", with = "duration_millis")]
    pub request_timeout: Duration,

    /// Interval between keep-alive probes while connected.
    #[serde(default = "default_keep_alive_interval", with = "duration_millis")]
    pub keep_alive_interval: Duration,

    /// Consecutive protocol errors after which the connection is recycled.
    #[serde(default = "default_protocol_error_threshold")]
    pub protocol_error_threshold: u32,

    /// Reconnection backoff.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Capacity of the notification queue between transport and engine.
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,

    /// Capacity of the lifecycle event broadcast.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_protocol_error_threshold() -> u32 {
    3
}

fn default_notification_queue_capacity() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            protocol_error_threshold: default_protocol_error_threshold(),
            retry: RetryPolicy::default(),
            notification_queue_capacity: default_notification_queue_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SessionConfig {
    /// Short timeouts and a fast retry policy for tests.
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(200),
            keep_alive_interval: Duration::from_millis(20),
            protocol_error_threshold: 3,
            retry: RetryPolicy::for_testing(),
            notification_queue_capacity: 256,
            event_capacity: 256,
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the keep-alive interval.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SessionResult<()> {
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(SessionError::invalid_argument("timeouts must be greater than zero"));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(SessionError::invalid_argument(
                "keep_alive_interval must be greater than zero",
            ));
        }
        if self.protocol_error_threshold == 0 {
            return Err(SessionError::invalid_argument(
                "protocol_error_threshold must be at least 1",
            ));
        }
        if self.notification_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(SessionError::invalid_argument("queue capacities must be at least 1"));
        }
        self.retry.validate().map_err(SessionError::invalid_argument)
    }
}

// =============================================================================
// ServerSession
// =============================================================================

/// One logical connection to one endpoint.
///
/// Cheap to clone; clones share the same session. Each instance is
/// independent, so sessions to different endpoints run concurrently.
///
/// Call [`ServerSession::disconnect`] to stop the background supervisor.
#[derive(Clone)]
pub struct ServerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    endpoint: Endpoint,
    config: SessionConfig,
    transport: Arc<dyn SessionTransport>,
    state: RwLock<SessionState>,
    generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    protocol_errors: AtomicU32,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
    notifications_tx: mpsc::Sender<SessionNotification>,
    notifications_rx: Mutex<Option<mpsc::Receiver<SessionNotification>>>,
    /// Serializes `connect` and `disconnect`.
    lifecycle: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<Supervisor>>,
    connection_lost: Notify,
    stats: SessionStats,
}

struct Supervisor {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Session supervisor terminated abnormally");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: SessionState,
    to: SessionState,
    generation: Generation,
}

impl ServerSession {
    /// Creates a disconnected session for `endpoint`.
    pub fn new(
        endpoint: Endpoint,
        transport: Arc<dyn SessionTransport>,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        endpoint.validate()?;
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (notifications_tx, notifications_rx) =
            mpsc::channel(config.notification_queue_capacity);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                endpoint,
                config,
                transport,
                state: RwLock::new(SessionState::Disconnected),
                generation: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                protocol_errors: AtomicU32::new(0),
                last_error: RwLock::new(None),
                events,
                notifications_tx,
                notifications_rx: Mutex::new(Some(notifications_rx)),
                lifecycle: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
                connection_lost: Notify::new(),
                stats: SessionStats::new(),
            }),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the session identifier.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Returns the current generation.
    pub fn generation(&self) -> Generation {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Returns `true` if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Returns a consistent `{state, generation}` view plus diagnostics.
    pub fn status(&self) -> SessionStatus {
        let (state, generation) = {
            let state = self.inner.state.read();
            (*state, self.inner.generation.load(Ordering::SeqCst))
        };

        SessionStatus {
            session_id: self.inner.id.to_string(),
            endpoint: self.inner.endpoint.url().to_string(),
            state,
            generation,
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self.inner.last_error.read().clone(),
        }
    }

    /// Returns session statistics.
    pub fn stats(&self) -> &SessionStats {
        &self.inner.stats
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Takes the generation-tagged notification stream.
    ///
    /// There is one stream per session; the first caller (normally the
    /// subscription engine) owns it.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<SessionNotification>> {
        self.inner.notifications_rx.lock().take()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connects to the endpoint.
    ///
    /// Fails with `Connection` if the first attempt fails. The session then
    /// keeps retrying in the background according to its retry policy.
    pub async fn connect(&self) -> SessionResult<Generation> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        self.inner.transition(SessionInput::Connect)?;
        tracing::info!(
            endpoint = %self.inner.endpoint,
            session_id = %self.inner.id,
            transport = self.inner.transport.name(),
            "Connecting"
        );

        let outcome = match self.inner.attempt_connect().await {
            Ok(generation) => Ok(generation),
            Err(error) => {
                self.inner.stats.record_failure();
                self.inner.set_last_error(error.to_string());
                // Connecting -> Reconnecting; ignored if disconnected meanwhile.
                let _ = self.inner.transition(SessionInput::TransportDown);
                tracing::warn!(
                    endpoint = %self.inner.endpoint,
                    error = %error,
                    "Initial connection failed, retrying in background"
                );
                Err(SessionError::connection(format!(
                    "{}: {}",
                    self.inner.endpoint, error
                )))
            }
        };

        self.spawn_supervisor();
        outcome
    }

    /// Disconnects. Idempotent; always succeeds.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let from = match self.inner.transition(SessionInput::Disconnect) {
            Ok(transition) => transition.from,
            Err(_) => SessionState::Disconnected,
        };

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }

        if from == SessionState::Disconnected {
            return;
        }

        if let Err(e) = self.inner.transport.disconnect().await {
            tracing::debug!(error = %e, "Transport reported an error on disconnect");
        }
        self.inner.reconnect_attempts.store(0, Ordering::Relaxed);

        tracing::info!(endpoint = %self.inner.endpoint, "Session closed");
        let _ = self.inner.events.send(SessionEvent::Closed);
    }

    /// Waits until the session is connected.
    ///
    /// Fails if the session fails, is disconnected, or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> SessionResult<Generation> {
        let mut events = self.inner.events.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            match self.state() {
                SessionState::Connected => return Ok(self.generation()),
                SessionState::Failed => {
                    return Err(SessionError::RetriesExhausted {
                        attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
                    })
                }
                SessionState::Disconnected => {
                    return Err(SessionError::not_connected(SessionState::Disconnected))
                }
                SessionState::Connecting | SessionState::Reconnecting => {}
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(SessionError::timeout(timeout)),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(SessionError::not_connected(self.state()))
                }
                Ok(_) => {}
            }
        }
    }

    fn spawn_supervisor(&self) {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(supervise(self.inner.clone(), shutdown.clone()));

        let previous = self
            .inner
            .supervisor
            .lock()
            .replace(Supervisor { shutdown, handle });
        if let Some(previous) = previous {
            previous.shutdown.notify_one();
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Reads the current value of a node.
    pub async fn read(&self, node_id: &NodeId) -> SessionResult<Value> {
        if node_id.is_empty() {
            return Err(SessionError::invalid_argument("node id must not be empty"));
        }
        self.inner.ensure_connected()?;
        self.inner.stats.record_read();
        self.inner.call(self.inner.transport.read(node_id)).await
    }

    /// Writes a value to a node.
    pub async fn write(&self, node_id: &NodeId, value: &Value) -> SessionResult<()> {
        if node_id.is_empty() {
            return Err(SessionError::invalid_argument("node id must not be empty"));
        }
        self.inner.ensure_connected()?;
        self.inner.stats.record_write();
        self.inner.call(self.inner.transport.write(node_id, value)).await
    }

    /// Creates a monitored item on the current connection.
    ///
    /// Returns the generation the item belongs to.
    pub async fn create_monitored_item(
        &self,
        node_id: &NodeId,
        sampling_interval: Duration,
    ) -> SessionResult<(Generation, ServerItemId)> {
        let generation = self.inner.ensure_connected()?;
        let item = self
            .inner
            .call(
                self.inner
                    .transport
                    .create_monitored_item(node_id, sampling_interval),
            )
            .await?;
        Ok((generation, item))
    }

    /// Deletes a monitored item created under `generation`.
    ///
    /// Items of an older generation no longer exist server-side; nothing is
    /// sent and `Ok(false)` is returned.
    pub async fn delete_monitored_item(
        &self,
        generation: Generation,
        item: ServerItemId,
    ) -> SessionResult<bool> {
        match self.inner.ensure_connected() {
            Ok(current) if current == generation => {}
            _ => return Ok(false),
        }
        self.inner
            .call(self.inner.transport.delete_monitored_item(item))
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint.url())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

// =============================================================================
// SessionInner
// =============================================================================

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    fn ensure_connected(&self) -> SessionResult<Generation> {
        let state = self.state.read();
        if state.is_connected() {
            Ok(self.generation.load(Ordering::SeqCst))
        } else {
            Err(SessionError::not_connected(*state))
        }
    }

    /// Applies `input` while the state lock is held.
    fn apply_locked(
        &self,
        state: &mut SessionState,
        input: SessionInput,
    ) -> Result<Transition, InvalidTransition> {
        let from = *state;
        let to = from.apply(input)?;
        *state = to;

        let generation = if input == SessionInput::TransportUp {
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.generation.load(Ordering::SeqCst)
        };

        Ok(Transition {
            from,
            to,
            generation,
        })
    }

    fn transition(&self, input: SessionInput) -> Result<Transition, InvalidTransition> {
        let transition = {
            let mut state = self.state.write();
            self.apply_locked(&mut *state, input)?
        };
        self.announce(&transition);
        Ok(transition)
    }

    fn announce(&self, transition: &Transition) {
        if transition.from != transition.to {
            tracing::trace!(
                old_state = %transition.from,
                new_state = %transition.to,
                generation = transition.generation,
                "Session state changed"
            );
            let _ = self.events.send(SessionEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
    }

    /// Moves `Connected -> Reconnecting`. Returns `false` if not connected.
    fn lose_connection(&self, reason: &str) -> bool {
        let transition = {
            let mut state = self.state.write();
            if !state.is_connected() {
                return false;
            }
            match self.apply_locked(&mut *state, SessionInput::TransportDown) {
                Ok(transition) => transition,
                Err(_) => return false,
            }
        };
        self.announce(&transition);

        self.protocol_errors.store(0, Ordering::Relaxed);
        self.stats.record_lost();
        self.set_last_error(reason);

        tracing::warn!(
            endpoint = %self.endpoint,
            generation = transition.generation,
            reason,
            "Session lost"
        );
        let _ = self.events.send(SessionEvent::Lost {
            generation: transition.generation,
            reason: reason.to_string(),
        });
        true
    }

    /// Counts a protocol error; recycles the connection past the threshold.
    ///
    /// Returns `true` if the connection was given up.
    fn record_protocol_error(&self, error: &SessionError) -> bool {
        self.stats.record_protocol_error();
        let count = self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            endpoint = %self.endpoint,
            error = %error,
            consecutive = count,
            "Protocol error"
        );

        if count >= self.config.protocol_error_threshold {
            return self.lose_connection(&format!(
                "{} consecutive protocol errors, last: {}",
                count, error
            ));
        }
        false
    }

    /// Runs a transport operation under the request timeout.
    ///
    /// Transport failures move the session to `Reconnecting` and are reported
    /// to the caller as `NotConnected`.
    async fn call<T, F>(&self, operation: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        let timeout = self.config.request_timeout;
        let result = match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::timeout(timeout)),
        };

        match result {
            Ok(value) => {
                self.protocol_errors.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(error) if error.is_transport_failure() => {
                if self.lose_connection(&error.to_string()) {
                    self.connection_lost.notify_one();
                }
                Err(SessionError::not_connected(self.state()))
            }
            Err(error @ SessionError::Protocol { .. }) => {
                if self.record_protocol_error(&error) {
                    self.connection_lost.notify_one();
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// One connection attempt. On success the session is `Connected` under
    /// a new generation.
    async fn attempt_connect(&self) -> SessionResult<Generation> {
        self.stats.record_connection_attempt();

        let (raw_tx, raw_rx) = mpsc::channel(self.config.notification_queue_capacity);
        let connect = self.transport.connect(&self.endpoint, raw_tx);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(error),
            Err(_) => return Err(SessionError::timeout(self.config.connect_timeout)),
        }

        let transition = match self.transition(SessionInput::TransportUp) {
            Ok(transition) => transition,
            Err(rejected) => {
                // Disconnected while the attempt was in flight.
                let _ = self.transport.disconnect().await;
                return Err(rejected.into());
            }
        };
        let generation = transition.generation;

        self.spawn_forwarder(raw_rx, generation);
        self.protocol_errors.store(0, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        *self.last_error.write() = None;
        self.stats.record_established();

        tracing::info!(
            endpoint = %self.endpoint,
            generation,
            transport = self.transport.name(),
            "Session established"
        );
        let _ = self.events.send(SessionEvent::Established { generation });

        Ok(generation)
    }

    /// Tags every notification of one connection with its generation.
    fn spawn_forwarder(&self, mut raw_rx: mpsc::Receiver<RawNotification>, generation: Generation) {
        let out = self.notifications_tx.clone();
        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                if out
                    .send(SessionNotification::tag(generation, raw))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            tracing::trace!(generation, "Notification forwarder finished");
        });
    }

    async fn probe(&self) {
        let timeout = self.config.request_timeout;
        let outcome = match tokio::time::timeout(timeout, self.transport.keep_alive()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::timeout(timeout)),
        };

        match outcome {
            Ok(()) => {}
            Err(error) if error.is_transport_failure() => {
                self.lose_connection(&format!("keep-alive failed: {}", error));
            }
            Err(error @ SessionError::Protocol { .. }) => {
                self.record_protocol_error(&error);
            }
            Err(error) => {
                tracing::debug!(error = %error, "Keep-alive probe returned an error");
            }
        }
    }

    /// Watches a live connection. Returns `false` on shutdown.
    async fn monitor(&self, shutdown: &Notify) -> bool {
        let period = self.config.keep_alive_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.state().is_connected() {
                return true;
            }
            tokio::select! {
                _ = shutdown.notified() => return false,
                _ = self.connection_lost.notified() => {}
                _ = ticker.tick() => self.probe().await,
            }
        }
    }

    fn give_up(&self, attempts: u32) {
        if self.transition(SessionInput::RetriesExhausted).is_err() {
            return;
        }
        self.stats.record_failure();
        self.set_last_error(SessionError::RetriesExhausted { attempts }.to_string());

        tracing::error!(endpoint = %self.endpoint, attempts, "Reconnection abandoned");
        let _ = self.events.send(SessionEvent::Failed { attempts });
    }
}

/// Background task: keep-alive while connected, backoff while reconnecting.
async fn supervise(inner: Arc<SessionInner>, shutdown: Arc<Notify>) {
    let mut backoff = Backoff::new(inner.config.retry.clone());

    loop {
        match inner.state() {
            SessionState::Connected => {
                backoff.reset();
                if !inner.monitor(&shutdown).await {
                    return;
                }
                if inner.state() == SessionState::Reconnecting {
                    let _ = inner.transport.disconnect().await;
                }
            }
            SessionState::Reconnecting => {
                let Some(delay) = backoff.next_delay() else {
                    inner.give_up(backoff.attempts());
                    return;
                };
                let attempt = backoff.attempts();
                inner.reconnect_attempts.store(attempt, Ordering::Relaxed);

                tracing::debug!(
                    endpoint = %inner.endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );

                tokio::select! {
                    _ = shutdown.notified() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let result = tokio::select! {
                    _ = shutdown.notified() => return,
                    result = inner.attempt_connect() => result,
                };

                if let Err(error) = result {
                    inner.stats.record_failure();
                    inner.set_last_error(error.to_string());
                    tracing::debug!(
                        endpoint = %inner.endpoint,
                        attempt,
                        error = %error,
                        "Reconnect attempt failed"
                    );
                }
            }
            SessionState::Disconnected | SessionState::Connecting | SessionState::Failed => {
                return
            }
        }
    }
}

// =============================================================================
// SessionStats
// =============================================================================

/// Statistics for session operations.
#[derive(Debug)]
pub struct SessionStats {
    /// Connection attempts, initial and retries.
    connection_attempts: AtomicU64,

    /// Successful (re)connects.
    established: AtomicU64,

    /// Live connections lost.
    lost: AtomicU64,

    /// Failed connection attempts and abandoned reconnects.
    failures: AtomicU64,

    /// Read operations issued.
    reads: AtomicU64,

    /// Write operations issued.
    writes: AtomicU64,

    /// Protocol errors observed.
    protocol_errors: AtomicU64,
}

impl SessionStats {
    /// Creates new session statistics.
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            established: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        }
    }

    /// Records a connection attempt.
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful (re)connect.
    pub fn record_established(&self) {
        self.established.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a lost connection.
    pub fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failure.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a read.
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a write.
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a protocol error.
    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of connection attempts.
    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    /// Returns the number of successful (re)connects.
    pub fn established(&self) -> u64 {
        self.established.load(Ordering::Relaxed)
    }

    /// Returns the number of lost connections.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Returns the number of failures.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Returns the number of reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of protocol errors.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Resets all statistics.
    pub fn reset(&self) {
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.established.store(0, Ordering::Relaxed);
        self.lost.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
