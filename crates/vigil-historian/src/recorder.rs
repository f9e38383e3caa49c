// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Historian control surface: which nodes of a session are recorded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vigil_core::error::{HistorianError, HistorianResult, SessionError, VigilResult};
use vigil_core::serde_helpers::duration_millis;
use vigil_core::types::{DataChangeEvent, DataChangeListener, NodeId};
use vigil_opcua::client::{SubscriptionEngine, SubscriptionHandle};

use crate::buffer::{BufferStatus, HistorianBuffer};

static NEXT_RECORDER_ID: AtomicU64 = AtomicU64::new(1);

/// Recorder state for status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderStatus {
    /// Whether recording is active.
    pub running: bool,

    /// Recorded nodes.
    pub node_ids: Vec<NodeId>,

    /// Sampling interval of the recorded items.
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,

    /// When recording started.
    pub started_at: Option<DateTime<Utc>>,

    /// Buffer state.
    pub buffer: BufferStatus,
}

/// Subscribes a set of nodes and feeds their events to a [`HistorianBuffer`].
#[derive(Clone)]
pub struct HistorianRecorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    engine: SubscriptionEngine,
    buffer: HistorianBuffer,
    listener: Arc<RecordingListener>,
    state: Mutex<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    handles: Vec<SubscriptionHandle>,
    node_ids: Vec<NodeId>,
    interval: Duration,
    started_at: Option<DateTime<Utc>>,
}

struct RecordingListener {
    name: String,
    buffer: HistorianBuffer,
    /// Items this recorder subscribed, as (node, sampling interval).
    items: RwLock<HashSet<(NodeId, Duration)>>,
}

impl DataChangeListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_data_change(&self, event: &DataChangeEvent) {
        // Other consumers may hold items for the same node at other intervals.
        let key = (event.node_id.clone(), event.sampling_interval);
        if !self.items.read().contains(&key) {
            return;
        }
        if let Err(error) = self.buffer.ingest(event) {
            tracing::debug!(node_id = %event.node_id, error = %error, "Event not recorded");
        }
    }
}

impl HistorianRecorder {
    /// Creates an idle recorder for `engine`.
    pub fn new(engine: SubscriptionEngine, buffer: HistorianBuffer) -> Self {
        let listener = Arc::new(RecordingListener {
            name: format!(
                "historian-{}-{}",
                engine.session().id(),
                NEXT_RECORDER_ID.fetch_add(1, Ordering::Relaxed)
            ),
            buffer: buffer.clone(),
            items: RwLock::new(HashSet::new()),
        });
        engine.add_listener(listener.clone());

        Self {
            inner: Arc::new(RecorderInner {
                engine,
                buffer,
                listener,
                state: Mutex::new(RecorderState::default()),
            }),
        }
    }

    /// Returns the buffer records are written to.
    pub fn buffer(&self) -> &HistorianBuffer {
        &self.inner.buffer
    }

    /// Starts recording `node_ids`. A running recording is stopped first.
    pub async fn start<I, N>(&self, node_ids: I, interval: Duration) -> VigilResult<()>
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let mut node_ids: Vec<NodeId> = node_ids.into_iter().map(Into::into).collect();
        node_ids.sort();
        node_ids.dedup();
        if node_ids.is_empty() {
            return Err(SessionError::invalid_argument("nothing to record").into());
        }

        let mut state = self.inner.state.lock().await;
        if !state.handles.is_empty() {
            tracing::info!("Historian recording restarted");
            if let Err(error) = self.stop_locked(&mut state).await {
                tracing::warn!(error = %error, "Flush before restart failed, records kept");
            }
        }

        let handles = self
            .inner
            .engine
            .subscribe_many(node_ids.iter().cloned(), interval)
            .await?;
        *self.inner.listener.items.write() = node_ids
            .iter()
            .map(|node_id| (node_id.clone(), interval))
            .collect();

        tracing::info!(
            nodes = node_ids.len(),
            interval_ms = interval.as_millis() as u64,
            "Historian recording started"
        );

        state.handles = handles;
        state.node_ids = node_ids;
        state.interval = interval;
        state.started_at = Some(Utc::now());
        Ok(())
    }

    /// Stops recording, releases the subscriptions and flushes.
    pub async fn stop(&self) -> VigilResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.handles.is_empty() {
            return Err(HistorianError::NotRunning.into());
        }
        self.stop_locked(&mut state).await?;
        tracing::info!("Historian recording stopped");
        Ok(())
    }

    async fn stop_locked(&self, state: &mut RecorderState) -> HistorianResult<()> {
        self.inner.listener.items.write().clear();

        for handle in std::mem::take(&mut state.handles) {
            if let Err(error) = self.inner.engine.unsubscribe(handle).await {
                tracing::warn!(error = %error, "Failed to release recorded item");
            }
        }
        state.node_ids.clear();
        state.started_at = None;

        self.inner.buffer.flush_now().await
    }

    /// Returns the recorder status.
    pub async fn status(&self) -> RecorderStatus {
        let state = self.inner.state.lock().await;
        RecorderStatus {
            running: !state.handles.is_empty(),
            node_ids: state.node_ids.clone(),
            interval: state.interval,
            started_at: state.started_at,
            buffer: self.inner.buffer.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HistorianConfig;
    use crate::sink::MockBatchSink;
    use vigil_core::error::VigilError;
    use vigil_opcua::client::{ServerSession, SessionConfig, SimulatedTransport, SubscriptionConfig};
    use vigil_opcua::types::Endpoint;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_records_only_selected_nodes() {
        let transport = Arc::new(SimulatedTransport::new());
        let session = ServerSession::new(
            Endpoint::new("opc.tcp://sim:4840"),
            transport.clone(),
            SessionConfig::for_testing(),
        )
        .unwrap();
        let engine = SubscriptionEngine::new(session.clone(), SubscriptionConfig::default()).unwrap();
        session.connect().await.unwrap();

        let sink = Arc::new(MockBatchSink::new());
        let buffer = HistorianBuffer::new(
            HistorianConfig::for_testing().with_max_batch_events(100),
            sink.clone(),
        )
        .unwrap();
        let recorder = HistorianRecorder::new(engine.clone(), buffer.clone());

        let mut stream = engine
            .stream(["ns=2;s=Other"], Duration::from_millis(100), 8)
            .await
            .unwrap();
        recorder
            .start(["ns=2;s=A", "ns=2;s=B"], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(recorder.status().await.running);

        let now = Utc::now();
        transport.emit("ns=2;s=A", 1.0f64, now).await;
        transport.emit("ns=2;s=Other", 2.0f64, now).await;
        transport.emit("ns=2;s=B", 3.0f64, now).await;
        stream.next().await.unwrap();

        wait_until(|| buffer.stats().ingested() == 2).await;

        recorder.stop().await.unwrap();
        assert_eq!(sink.record_count(), 2);
        assert!(!recorder.status().await.running);
        assert!(matches!(
            recorder.stop().await,
            Err(VigilError::Historian(HistorianError::NotRunning))
        ));

        // Released items are deleted server-side; the stream's item remains.
        assert_eq!(transport.live_items().len(), 1);

        stream.close().await;
        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_start_restarts_running_recording() {
        let transport = Arc::new(SimulatedTransport::new());
        let session = ServerSession::new(
            Endpoint::new("opc.tcp://sim:4840"),
            transport.clone(),
            SessionConfig::for_testing(),
        )
        .unwrap();
        let engine = SubscriptionEngine::new(session.clone(), SubscriptionConfig::default()).unwrap();
        session.connect().await.unwrap();

        let buffer = HistorianBuffer::new(
            HistorianConfig::for_testing(),
            Arc::new(MockBatchSink::new()),
        )
        .unwrap();
        let recorder = HistorianRecorder::new(engine.clone(), buffer);

        recorder.start(["a"], Duration::from_millis(100)).await.unwrap();
        recorder.start(["b", "c", "b"], Duration::from_millis(200)).await.unwrap();

        let status = recorder.status().await;
        assert_eq!(status.node_ids, vec![NodeId::new("b"), NodeId::new("c")]);
        assert_eq!(status.interval, Duration::from_millis(200));
        assert_eq!(transport.live_items().len(), 2);

        let empty: Vec<NodeId> = Vec::new();
        assert!(recorder.start(empty, Duration::from_millis(100)).await.is_err());

        engine.shutdown().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_records_once_when_node_is_also_streamed() {
        let transport = Arc::new(SimulatedTransport::new());
        let session = ServerSession::new(
            Endpoint::new("opc.tcp://sim:4840"),
            transport.clone(),
            SessionConfig::for_testing(),
        )
        .unwrap();
        let engine = SubscriptionEngine::new(session.clone(), SubscriptionConfig::default()).unwrap();
        session.connect().await.unwrap();

        let sink = Arc::new(MockBatchSink::new());
        let buffer = HistorianBuffer::new(HistorianConfig::for_testing(), sink.clone()).unwrap();
        let recorder = HistorianRecorder::new(engine.clone(), buffer.clone());

        recorder.start(["n1"], Duration::from_millis(1000)).await.unwrap();
        let mut stream = engine.stream(["n1"], Duration::from_millis(100), 8).await.unwrap();
        assert_eq!(transport.live_items().len(), 2);

        transport.emit("n1", 10i32, Utc::now()).await;
        let event = stream.next().await.unwrap();
        assert_eq!(event.sampling_interval, Duration::from_millis(100));
        wait_until(|| buffer.stats().ingested() >= 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(stream.try_next().is_none());
        assert_eq!(buffer.stats().ingested(), 1);
        recorder.stop().await.unwrap();
        assert_eq!(sink.record_count(), 1);

        stream.close().await;
        engine.shutdown().await;
        session.disconnect().await;
    }
}
