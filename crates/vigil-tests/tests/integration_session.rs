// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Session Integration Tests
//!
//! - `test_session_*`: connection lifecycle and generations
//! - `test_stream_*`: live consumers across reconnects and overruns
//! - `test_items_*`: item sharing between consumers

use std::time::Duration;

use vigil_core::{SessionError, Value};
use vigil_opcua::SessionState;

use vigil_tests::common::{
    fixtures::at,
    harness::ServerHarness,
    init_test_logging, wait_until, WAIT,
};

const SPEED: &str = "ns=2;s=Line1.Speed";
const INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Session Lifecycle
// =============================================================================

#[tokio::test]
async fn test_session_generation_increments_per_connection() {
    init_test_logging();
    let server = ServerHarness::connected().await;

    let status = server.session.status();
    assert_eq!(status.state, SessionState::Connected);
    assert_eq!(status.generation, 1);
    assert_eq!(status.endpoint, "opc.tcp://sim:4840");

    assert_eq!(server.reconnect().await, 2);
    assert_eq!(server.reconnect().await, 3);
    assert_eq!(server.transport.connect_attempts(), 3);

    server.session.disconnect().await;
    server.session.disconnect().await;
    assert_eq!(server.session.state(), SessionState::Disconnected);
    assert_eq!(server.session.generation(), 3);

    server.teardown().await;
}

#[tokio::test]
async fn test_session_retries_unreachable_endpoint_in_background() {
    init_test_logging();
    let server = ServerHarness::new();
    server.transport.set_reachable(false);

    let error = server.session.connect().await.unwrap_err();
    assert!(matches!(error, SessionError::Connection { .. }));
    assert!(server.session.status().last_error.is_some());

    wait_until(|| server.transport.connect_attempts() >= 3).await;
    assert!(!server.session.is_connected());

    server.transport.set_reachable(true);
    let generation = server.session.wait_connected(WAIT).await.unwrap();
    assert_eq!(generation, 1);
    assert_eq!(server.session.status().reconnect_attempts, 0);

    server.teardown().await;
}

// =============================================================================
// Live Streams
// =============================================================================

#[tokio::test]
async fn test_stream_continues_after_reconnect() {
    init_test_logging();
    let server = ServerHarness::connected().await;
    let mut stream = server.engine.stream([SPEED], INTERVAL, 16).await.unwrap();

    server.transport.emit(SPEED, 1.0f64, at(0)).await;
    let before = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(before.generation, 1);

    server.reconnect().await;

    server.transport.emit(SPEED, 2.0f64, at(1)).await;
    let after = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(after.generation, 2);
    assert_eq!(after.value, Value::Float64(2.0));
    assert_eq!(server.engine.stats().items_recreated(), 1);

    stream.close().await;
    server.teardown().await;
}

#[tokio::test]
async fn test_stream_slow_consumer_drops_oldest() {
    init_test_logging();
    let server = ServerHarness::connected().await;
    let mut slow = server.engine.stream([SPEED], INTERVAL, 2).await.unwrap();
    let mut fast = server.engine.stream([SPEED], INTERVAL, 16).await.unwrap();

    for i in 0..5i64 {
        server.transport.emit(SPEED, i as f64, at(i)).await;
    }
    wait_until(|| server.engine.stats().dispatched() == 5).await;

    let mut kept = Vec::new();
    while let Some(event) = slow.try_next() {
        kept.push(event.value);
    }
    assert_eq!(kept, vec![Value::Float64(3.0), Value::Float64(4.0)]);
    assert_eq!(slow.overruns(), 3);

    // The fast consumer is unaffected.
    let mut all = 0;
    while fast.try_next().is_some() {
        all += 1;
    }
    assert_eq!(all, 5);
    assert_eq!(fast.overruns(), 0);

    slow.close().await;
    fast.close().await;
    server.teardown().await;
}

// =============================================================================
// Item Sharing
// =============================================================================

#[tokio::test]
async fn test_items_are_shared_between_consumers() {
    init_test_logging();
    let server = ServerHarness::connected().await;

    let handle = server.engine.subscribe(SPEED, INTERVAL).await.unwrap();
    let stream = server.engine.stream([SPEED], INTERVAL, 8).await.unwrap();
    assert_eq!(server.transport.item_creations(), 1);
    assert_eq!(server.engine.items().await[0].refcount, 2);

    stream.close().await;
    assert_eq!(server.transport.live_items().len(), 1);

    server.engine.unsubscribe(handle).await.unwrap();
    assert!(server.transport.live_items().is_empty());
    assert_eq!(server.transport.item_deletions(), 1);

    server.teardown().await;
}
