// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Runtime orchestration.
//!
//! For every enabled server the runtime wires:
//!
//! - a transport and a [`ServerSession`] supervising it
//! - a [`SubscriptionEngine`] for the configured tags
//! - a [`HistorianBuffer`] with one [`HistorianRecorder`] per sampling interval
//!   of the historized tags
//!
//! and tears them down in reverse order on shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vigil_config::{load_config, ServerConfig, VigilConfig};
use vigil_core::{NodeId, SessionError};
use vigil_historian::{FileBatchSink, HistorianBuffer, HistorianRecorder};
use vigil_opcua::{
    ServerSession, SimulatedTransport, SubscriptionEngine, SubscriptionHandle,
};

use crate::error::{BinError, BinResult};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

// =============================================================================
// VigilRuntime
// =============================================================================

/// Runs sessions, subscriptions and the historian until shutdown is signaled.
pub struct VigilRuntime {
    config: Arc<VigilConfig>,
    shutdown: ShutdownCoordinator,
    historian_enabled: bool,
}

impl VigilRuntime {
    /// Creates a runtime for `config`.
    pub fn new(config: VigilConfig) -> Self {
        let historian_enabled = config.historian.enabled;
        Self {
            config: Arc::new(config),
            shutdown: ShutdownCoordinator::new(),
            historian_enabled,
        }
    }

    /// Disables recording regardless of the configuration.
    pub fn with_historian(mut self, enabled: bool) -> Self {
        self.historian_enabled = enabled && self.config.historian.enabled;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    /// Returns the shutdown coordinator. Initiating shutdown on it stops
    /// [`run`](Self::run).
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Runs until shutdown is signaled.
    pub async fn run(self) -> BinResult<()> {
        info!(
            instance_id = %self.config.runtime.instance_id,
            servers = self.config.enabled_servers().count(),
            historian = self.historian_enabled,
            "Starting Vigil v{}",
            vigil_core::VERSION
        );

        let mut units = Vec::new();
        for server in self.config.enabled_servers() {
            match self.start_server(server).await {
                Ok(unit) => units.push(unit),
                Err(e) => {
                    error!(server_id = %server.id, error = %e, "Failed to start server");
                    self.stop_all(units).await;
                    return Err(e.with_context(format!("server '{}'", server.id)));
                }
            }
        }

        info!(servers = units.len(), "Vigil is ready");

        let status_task = tokio::spawn(status_loop(
            self.config.runtime.status_interval,
            units.iter().map(UnitView::from).collect(),
            self.shutdown.shutdown_signal(),
        ));

        self.shutdown.wait_for_shutdown().await;
        info!("Shutdown initiated, cleaning up...");

        let timeout = self.config.runtime.shutdown_timeout;
        if tokio::time::timeout(timeout, self.stop_all(units)).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Shutdown timed out");
        }
        status_task.abort();

        info!("Vigil shutdown complete");
        Ok(())
    }

    async fn start_server(&self, server: &ServerConfig) -> BinResult<ServerUnit> {
        let transport = Arc::new(SimulatedTransport::named(server.id.clone()));
        let session = ServerSession::new(
            server.endpoint(),
            transport.clone(),
            server.session.clone(),
        )?;
        let engine = SubscriptionEngine::new(session.clone(), self.config.fanout.subscription_config())?;

        let buffer = if self.historian_enabled && server.historized_tags().next().is_some() {
            let dir = server_history_dir(&self.config.historian.data_dir, &server.id);
            let sink = FileBatchSink::open(&dir)?;
            let buffer = HistorianBuffer::new(self.config.historian.clone(), Arc::new(sink))?;
            buffer.start()?;
            info!(server_id = %server.id, dir = %dir.display(), "Historian started");
            Some(buffer)
        } else {
            None
        };

        let generator = transport.spawn_generator(self.config.runtime.simulation_period);

        if let Err(e) = session.connect().await {
            warn!(
                server_id = %server.id,
                endpoint = %server.endpoint_url,
                error = %e,
                "Initial connect failed, retrying in the background"
            );
        }

        let activation = Arc::new(Mutex::new(Activation::default()));
        let activator = tokio::spawn(activate(
            server.clone(),
            engine.clone(),
            buffer.clone(),
            activation.clone(),
            self.config.runtime.status_interval,
            self.shutdown.shutdown_signal(),
        ));

        Ok(ServerUnit {
            id: server.id.clone(),
            session,
            engine,
            buffer,
            generator,
            activator,
            activation,
        })
    }

    async fn stop_all(&self, units: Vec<ServerUnit>) {
        for unit in units {
            unit.stop().await;
        }
    }
}

/// Directory of a server's batch files below the historian data directory.
pub fn server_history_dir(data_dir: &Path, server_id: &str) -> PathBuf {
    let name: String = server_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    data_dir.join(name)
}

// =============================================================================
// ServerUnit
// =============================================================================

/// Everything the runtime owns for one server.
struct ServerUnit {
    id: String,
    session: ServerSession,
    engine: SubscriptionEngine,
    buffer: Option<HistorianBuffer>,
    generator: JoinHandle<()>,
    activator: JoinHandle<()>,
    activation: Arc<Mutex<Activation>>,
}

/// Subscriptions made once the session first comes up.
#[derive(Default)]
struct Activation {
    handles: Vec<SubscriptionHandle>,
    recorders: Vec<HistorianRecorder>,
}

impl ServerUnit {
    async fn stop(self) {
        debug!(server_id = %self.id, "Stopping server");
        self.activator.abort();

        let activation = std::mem::take(&mut *self.activation.lock().await);
        for recorder in activation.recorders {
            if let Err(e) = recorder.stop().await {
                warn!(server_id = %self.id, error = %e, "Failed to stop recorder");
            }
        }
        for handle in activation.handles {
            if let Err(e) = self.engine.unsubscribe(handle).await {
                debug!(server_id = %self.id, error = %e, "Unsubscribe failed");
            }
        }

        self.engine.shutdown().await;
        if let Some(buffer) = &self.buffer {
            buffer.shutdown().await;
        }
        self.generator.abort();
        self.session.disconnect().await;
        info!(server_id = %self.id, "Server stopped");
    }
}

/// Waits for the first connection, then subscribes the live tags and starts
/// the recorders. Items are replayed by the engine on later reconnects.
async fn activate(
    server: ServerConfig,
    engine: SubscriptionEngine,
    buffer: Option<HistorianBuffer>,
    activation: Arc<Mutex<Activation>>,
    poll: Duration,
    mut shutdown: ShutdownSignal,
) {
    let session = engine.session().clone();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            result = session.wait_connected(poll) => match result {
                Ok(generation) => {
                    debug!(server_id = %server.id, %generation, "Session available");
                    break;
                }
                Err(SessionError::Timeout { .. }) => {
                    warn!(server_id = %server.id, "Server still unreachable");
                }
                Err(e) => {
                    error!(server_id = %server.id, error = %e, "Server abandoned");
                    return;
                }
            }
        }
    }

    let mut guard = activation.lock().await;

    for tag in server.tags.iter().filter(|t| !t.historize || buffer.is_none()) {
        match engine.subscribe(tag.node(), tag.interval()).await {
            Ok(handle) => guard.handles.push(handle),
            Err(e) => warn!(
                server_id = %server.id,
                node_id = %tag.node_id,
                error = %e,
                "Failed to subscribe tag"
            ),
        }
    }

    if let Some(buffer) = buffer {
        let mut groups: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
        for tag in server.historized_tags() {
            groups.entry(tag.interval_ms).or_default().push(tag.node());
        }

        for (interval_ms, nodes) in groups {
            let recorder = HistorianRecorder::new(engine.clone(), buffer.clone());
            match recorder
                .start(nodes, Duration::from_millis(interval_ms))
                .await
            {
                Ok(()) => guard.recorders.push(recorder),
                Err(e) => error!(
                    server_id = %server.id,
                    interval_ms,
                    error = %e,
                    "Failed to start recorder"
                ),
            }
        }
    }

    info!(
        server_id = %server.id,
        live = guard.handles.len(),
        recorders = guard.recorders.len(),
        "Server activated"
    );
}

// =============================================================================
// Status Loop
// =============================================================================

struct UnitView {
    id: String,
    session: ServerSession,
    engine: SubscriptionEngine,
    buffer: Option<HistorianBuffer>,
}

impl From<&ServerUnit> for UnitView {
    fn from(unit: &ServerUnit) -> Self {
        Self {
            id: unit.id.clone(),
            session: unit.session.clone(),
            engine: unit.engine.clone(),
            buffer: unit.buffer.clone(),
        }
    }
}

async fn status_loop(period: Duration, units: Vec<UnitView>, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                for unit in &units {
                    let status = unit.session.status();
                    let fanout = unit.engine.fanout().stats();
                    let buffered = unit.buffer.as_ref().map(|b| b.buffered()).unwrap_or(0);
                    info!(
                        server_id = %unit.id,
                        state = %status.state,
                        generation = %status.generation,
                        reconnect_attempts = status.reconnect_attempts,
                        dispatched = unit.engine.stats().dispatched(),
                        consumers = fanout.active_consumers,
                        overruns = fanout.overruns,
                        buffered,
                        "Status"
                    );
                }
            }
        }
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for constructing the runtime.
pub struct RuntimeBuilder {
    config_path: Option<PathBuf>,
    config: Option<VigilConfig>,
    historian: bool,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder.
    pub fn new() -> Self {
        Self {
            config_path: None,
            config: None,
            historian: true,
        }
    }

    /// Sets the configuration file path.
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the configuration directly.
    pub fn config(mut self, config: VigilConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Enables or disables recording.
    pub fn historian(mut self, enabled: bool) -> Self {
        self.historian = enabled;
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> BinResult<VigilRuntime> {
        let config = match self.config {
            Some(cfg) => cfg,
            None => {
                let path = self
                    .config_path
                    .ok_or_else(|| BinError::config("No configuration provided"))?;

                load_config(&path).map_err(|e| {
                    BinError::config(format!("Failed to load config from {:?}: {}", path, e))
                })?
            }
        };

        Ok(VigilRuntime::new(config).with_historian(self.historian))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
