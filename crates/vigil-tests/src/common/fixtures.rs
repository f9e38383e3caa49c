// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Fixtures
//!
//! Deterministic timestamps, events and configuration documents.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use vigil_core::{DataChangeEvent, Generation, Value};
use vigil_historian::HistorianConfig;

/// Base instant of all fixture timestamps.
pub const BASE_EPOCH_SECS: i64 = 1_700_000_000;

/// Fixture timestamp `seconds` after [`BASE_EPOCH_SECS`].
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_EPOCH_SECS + seconds, 0)
        .single()
        .expect("valid fixture timestamp")
}

/// An event for `node_id` at fixture time `seconds`.
pub fn event(
    node_id: &str,
    value: impl Into<Value>,
    seconds: i64,
    generation: Generation,
) -> DataChangeEvent {
    DataChangeEvent::new(node_id, value, at(seconds), generation)
}

/// Extracts the `f64` view of each value.
pub fn as_f64s<'a>(values: impl IntoIterator<Item = &'a Value>) -> Vec<f64> {
    values.into_iter().filter_map(Value::as_f64).collect()
}

// =============================================================================
// Historian Fixtures
// =============================================================================

/// Pre-built historian configurations.
pub struct HistorianFixtures;

impl HistorianFixtures {
    /// Small batches and short timers writing below `dir`.
    pub fn config(dir: &std::path::Path) -> HistorianConfig {
        HistorianConfig::for_testing().with_data_dir(dir)
    }

    /// Batches are only sealed by an explicit flush.
    pub fn manual_flush(dir: &std::path::Path) -> HistorianConfig {
        HistorianConfig::for_testing()
            .with_data_dir(dir)
            .with_max_batch_events(1_000)
            .with_max_buffered_events(10_000)
            .with_max_batch_latency(Duration::from_secs(3600))
    }
}

// =============================================================================
// Config Fixtures
// =============================================================================

/// Configuration documents in the supported formats.
pub struct ConfigFixtures;

impl ConfigFixtures {
    /// A YAML document with two servers, one disabled.
    pub fn yaml() -> &'static str {
        r#"
runtime:
  instance_id: line-1
  status_interval_ms: 5000

servers:
  - id: plc-01
    name: Press line
    endpoint_url: "opc.tcp://10.0.0.10:4840"
    security:
      policy: basic256_sha256
      mode: sign_and_encrypt
      certificate_path: pki/client.der
      private_key_path: pki/client.pem
    tags:
      - { node_id: "ns=2;s=Line1.Speed", interval_ms: 500, historize: true }
      - { node_id: "ns=2;s=Line1.Temp", interval_ms: 500, historize: true }
      - { node_id: "ns=2;s=Line1.Alarm", interval_ms: 250 }
  - id: plc-02
    endpoint_url: "opc.tcp://10.0.0.11:4840"
    enabled: false

historian:
  data_dir: ./history
  max_batch_events: 200
  max_batch_latency_ms: 500

fanout:
  consumer_capacity: 64

logging:
  level: debug
  format: json
"#
    }

    /// The same servers as [`yaml`](Self::yaml) in TOML, reduced to one.
    pub fn toml() -> &'static str {
        r#"
[runtime]
instance_id = "line-1"

[[servers]]
id = "plc-01"
endpoint_url = "opc.tcp://10.0.0.10:4840"

[[servers.tags]]
node_id = "ns=2;s=Line1.Speed"
interval_ms = 500
historize = true

[historian]
max_batch_events = 50
"#
    }

    /// A JSON document with a duplicate server id.
    pub fn json_duplicate_servers() -> &'static str {
        r#"{
  "servers": [
    { "id": "plc", "endpoint_url": "opc.tcp://a:4840" },
    { "id": "plc", "endpoint_url": "opc.tcp://b:4840" }
  ]
}"#
    }
}
