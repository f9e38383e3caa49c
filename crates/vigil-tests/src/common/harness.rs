// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Harness
//!
//! Wired-up pipelines over the simulated transport:
//!
//! ```text
//! SimulatedTransport ─► ServerSession ─► SubscriptionEngine ─► HistorianRecorder
//!                                                                   │
//!                                 TrendQueryEngine ◄── BatchStore ◄─┘ HistorianBuffer
//! ```

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::broadcast;

use vigil_core::Generation;
use vigil_historian::{
    BatchStore, FileBatchSink, HistorianBuffer, HistorianConfig, HistorianRecorder,
    TrendQueryEngine,
};
use vigil_opcua::types::Endpoint;
use vigil_opcua::{
    ServerSession, SessionConfig, SimulatedTransport, SubscriptionConfig, SubscriptionEngine,
    SubscriptionSignal,
};

use super::{temp_test_dir, WAIT};

// =============================================================================
// ServerHarness
// =============================================================================

/// A session and subscription engine over a [`SimulatedTransport`].
pub struct ServerHarness {
    /// The simulated server.
    pub transport: Arc<SimulatedTransport>,
    /// Session to the simulated server.
    pub session: ServerSession,
    /// Engine on the session.
    pub engine: SubscriptionEngine,
}

impl ServerHarness {
    /// Creates a disconnected harness with fast test timings.
    pub fn new() -> Self {
        Self::with_config(SessionConfig::for_testing(), SubscriptionConfig::default())
    }

    /// Creates a disconnected harness.
    pub fn with_config(session: SessionConfig, subscription: SubscriptionConfig) -> Self {
        let transport = Arc::new(SimulatedTransport::named("harness"));
        let session = ServerSession::new(
            Endpoint::new("opc.tcp://sim:4840"),
            transport.clone(),
            session,
        )
        .expect("valid session config");
        let engine =
            SubscriptionEngine::new(session.clone(), subscription).expect("fresh session");

        Self {
            transport,
            session,
            engine,
        }
    }

    /// Creates a connected harness.
    pub async fn connected() -> Self {
        let harness = Self::new();
        harness.session.connect().await.expect("simulated connect");
        harness
    }

    /// Drops the connection and waits until the engine has replayed its
    /// items on the next generation. Returns that generation.
    pub async fn reconnect(&self) -> Generation {
        let mut signals = self.engine.subscribe_signals();
        let next = self.session.generation() + 1;

        assert!(self.transport.drop_connection(), "harness was not connected");
        wait_for_replay(&mut signals, next).await;
        next
    }

    /// Stops the engine and closes the session.
    pub async fn teardown(self) {
        self.engine.shutdown().await;
        self.session.disconnect().await;
    }
}

impl Default for ServerHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for `ReplayCompleted` of `generation`. Returns `(recreated, failed)`.
pub async fn wait_for_replay(
    signals: &mut broadcast::Receiver<SubscriptionSignal>,
    generation: Generation,
) -> (usize, usize) {
    loop {
        let signal = tokio::time::timeout(WAIT, signals.recv())
            .await
            .expect("replay signal in time")
            .expect("signal channel open");
        if let SubscriptionSignal::ReplayCompleted {
            generation: g,
            recreated,
            failed,
        } = signal
        {
            if g == generation {
                return (recreated, failed);
            }
        }
    }
}

// =============================================================================
// HistorianHarness
// =============================================================================

/// A file-backed historian buffer and its query engine in a temp directory.
pub struct HistorianHarness {
    dir: TempDir,
    /// The running buffer.
    pub buffer: HistorianBuffer,
    /// Query engine including pending records.
    pub query: TrendQueryEngine,
}

impl HistorianHarness {
    /// Creates a started buffer with the default test configuration.
    pub fn new() -> Self {
        Self::with_config(|dir| HistorianConfig::for_testing().with_data_dir(dir))
    }

    /// Creates a started buffer; `configure` receives the data directory.
    pub fn with_config(configure: impl FnOnce(&Path) -> HistorianConfig) -> Self {
        let dir = temp_test_dir("vigil-historian");
        let (buffer, query) = open(dir.path(), configure(dir.path()));
        Self { dir, buffer, query }
    }

    /// The data directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Store over the committed batches.
    pub fn store(&self) -> BatchStore {
        BatchStore::open(self.dir.path()).expect("open batch store")
    }

    /// Query engine over committed batches only.
    pub fn committed_query(&self) -> TrendQueryEngine {
        TrendQueryEngine::new(self.store())
    }

    /// Shuts the buffer down and opens a new one over the same directory.
    pub async fn restart(&mut self, config: HistorianConfig) {
        self.buffer.shutdown().await;
        let (buffer, query) = open(self.dir.path(), config);
        self.buffer = buffer;
        self.query = query;
    }

    /// Creates a recorder feeding this buffer from `engine`.
    pub fn recorder(&self, engine: &SubscriptionEngine) -> HistorianRecorder {
        HistorianRecorder::new(engine.clone(), self.buffer.clone())
    }
}

impl Default for HistorianHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn open(dir: &Path, config: HistorianConfig) -> (HistorianBuffer, TrendQueryEngine) {
    let sink = FileBatchSink::open(dir).expect("open file sink");
    let store = sink.store().clone();
    let buffer = HistorianBuffer::new(config, Arc::new(sink)).expect("valid historian config");
    buffer.start().expect("start buffer");
    let query = TrendQueryEngine::new(store).with_buffer(buffer.clone());
    (buffer, query)
}
