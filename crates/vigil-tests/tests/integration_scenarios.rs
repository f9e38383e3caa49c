// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # End-to-End Scenarios
//!
//! Values travel from the simulated server through the session, the
//! subscription engine and the recorder into durable batches, and are read
//! back through the trend query engine.

use std::time::Duration;

use vigil_core::{NodeId, Value};
use vigil_historian::Aggregator;

use vigil_tests::common::{
    fixtures::{at, event},
    harness::{HistorianHarness, ServerHarness},
    init_test_logging, wait_until,
};

const N1: &str = "n1";

// =============================================================================
// Last-N across a reconnect
// =============================================================================

#[tokio::test]
async fn test_last_n_spans_a_reconnect() {
    init_test_logging();
    let server = ServerHarness::connected().await;
    let historian = HistorianHarness::with_config(|dir| {
        vigil_historian::HistorianConfig::for_testing()
            .with_data_dir(dir)
            .with_max_batch_events(2)
    });
    let recorder = historian.recorder(&server.engine);
    recorder.start([N1], Duration::from_millis(100)).await.unwrap();

    for (offset, value) in (10i32..13).enumerate() {
        server.transport.emit(N1, value, at(offset as i64)).await;
    }
    wait_until(|| historian.buffer.stats().ingested() == 3).await;

    let generation = server.reconnect().await;
    assert_eq!(generation, 2);
    assert_eq!(server.transport.live_items().len(), 1);

    for (offset, value) in (13i32..15).enumerate() {
        server.transport.emit(N1, value, at(3 + offset as i64)).await;
    }
    wait_until(|| historian.buffer.stats().ingested() == 5).await;

    let node = NodeId::new(N1);
    let expected: Vec<Value> = (10i32..15).map(Value::Int32).collect();

    let last = historian.query.query_last_n(&node, 5).await.unwrap();
    assert_eq!(last.iter().map(|p| p.value.clone()).collect::<Vec<_>>(), expected);
    assert_eq!(last.first().unwrap().timestamp, at(0));
    assert_eq!(last.last().unwrap().timestamp, at(4));

    let tail = historian.query.query_last_n(&node, 3).await.unwrap();
    assert_eq!(
        tail.iter().map(|p| p.value.clone()).collect::<Vec<_>>(),
        expected[2..].to_vec()
    );

    // Stopping flushes; everything is durable afterwards.
    recorder.stop().await.unwrap();
    let committed = historian.committed_query().query_last_n(&node, 5).await.unwrap();
    assert_eq!(
        committed.iter().map(|p| p.value.clone()).collect::<Vec<_>>(),
        expected
    );

    let generations: Vec<u64> = historian
        .store()
        .scan(&node, None)
        .unwrap()
        .iter()
        .map(|r| r.generation)
        .collect();
    assert_eq!(generations, vec![1, 1, 1, 2, 2]);

    historian.buffer.shutdown().await;
    server.teardown().await;
}

// =============================================================================
// Bucketed average
// =============================================================================

#[tokio::test]
async fn test_bucketed_average_of_four_samples() {
    init_test_logging();
    let historian = HistorianHarness::new();

    for (seconds, value) in [(0, 10.0f64), (3, 20.0f64), (6, 30.0f64), (9, 40.0f64)] {
        historian.buffer.ingest(&event(N1, value, seconds, 1)).unwrap();
    }
    historian.buffer.flush_now().await.unwrap();

    let buckets = historian
        .query
        .query_bucketed(
            &NodeId::new(N1),
            at(0),
            at(9),
            Duration::from_secs(5),
            Aggregator::default(),
        )
        .await
        .unwrap();

    let summary: Vec<(chrono::DateTime<chrono::Utc>, Value)> = buckets
        .iter()
        .map(|b| (b.bucket_start, b.value.clone()))
        .collect();
    assert_eq!(
        summary,
        vec![(at(0), Value::Float64(15.0)), (at(5), Value::Float64(35.0))]
    );
    assert!(buckets.iter().all(|b| b.samples == 2));

    historian.buffer.shutdown().await;
}

#[tokio::test]
async fn test_bucketed_average_through_the_pipeline() {
    init_test_logging();
    let server = ServerHarness::connected().await;
    let historian = HistorianHarness::new();
    let recorder = historian.recorder(&server.engine);
    recorder.start([N1], Duration::from_millis(100)).await.unwrap();

    for (seconds, value) in [(0, 10.0f64), (3, 20.0f64), (6, 30.0f64), (9, 40.0f64)] {
        server.transport.emit(N1, value, at(seconds)).await;
    }
    wait_until(|| historian.buffer.stats().ingested() == 4).await;
    recorder.stop().await.unwrap();

    let buckets = historian
        .committed_query()
        .query_bucketed(
            &NodeId::new(N1),
            at(0),
            at(20),
            Duration::from_secs(5),
            Aggregator::Average,
        )
        .await
        .unwrap();

    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].value, Value::Float64(15.0));
    assert_eq!(buckets[1].value, Value::Float64(35.0));

    historian.buffer.shutdown().await;
    server.teardown().await;
}
