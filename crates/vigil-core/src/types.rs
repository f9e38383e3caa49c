// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core data types for Vigil.
//!
//! This module provides the protocol-agnostic data types shared by the
//! session, subscription and historian layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use crate::serde_helpers::duration_millis;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a data point on a remote automation server.
///
/// The identifier is opaque to Vigil: it is passed verbatim to the transport
/// and used as the key for subscriptions and history.
///
/// # Examples
///
/// ```
/// use vigil_core::types::NodeId;
///
/// let id = NodeId::new("ns=2;s=Line1.Speed");
/// assert_eq!(id.as_str(), "ns=2;s=Line1.Speed");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new node ID.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the ID and returns the inner string.
    #[inline]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns `true` if the identifier is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Session generation counter.
///
/// Incremented on every successful (re)connect. Server-side state created
/// under one generation is invalid under any later one.
pub type Generation = u64;

// =============================================================================
// Value Types
// =============================================================================

/// A protocol-agnostic data value.
///
/// # Examples
///
/// ```
/// use vigil_core::types::Value;
///
/// let speed = Value::Float64(25.5);
/// assert_eq!(speed.as_f64(), Some(25.5));
///
/// let running = Value::Bool(true);
/// assert_eq!(running.as_bool(), Some(true));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Boolean value
    Bool(bool),

    /// Signed 32-bit integer
    Int32(i32),

    /// Signed 64-bit integer
    Int64(i64),

    /// Unsigned 32-bit integer
    UInt32(u32),

    /// Unsigned 64-bit integer
    UInt64(u64),

    /// 32-bit floating point
    Float32(f32),

    /// 64-bit floating point
    Float64(f64),

    /// UTF-8 string
    String(String),

    /// Date and time
    DateTime(DateTime<Utc>),

    /// Null/undefined value
    Null,
}

impl Value {
    /// Returns the type name of this value.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::types::Value;
    ///
    /// assert_eq!(Value::Float64(1.0).type_name(), "float64");
    /// assert_eq!(Value::Bool(true).type_name(), "bool");
    /// ```
    #[inline]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::UInt32(_) => "uint32",
            Value::UInt64(_) => "uint64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Null => "null",
        }
    }

    /// Returns `true` if this is a null value.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` if this is a numeric value (integer or float).
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int32(_)
                | Value::Int64(_)
                | Value::UInt32(_)
                | Value::UInt64(_)
                | Value::Float32(_)
                | Value::Float64(_)
        )
    }

    /// Attempts to convert this value to a boolean.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Attempts to convert this value to an f64.
    ///
    /// Booleans map to `0.0`/`1.0` so that digital signals can be averaged.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt32(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Attempts to get this value as a string reference.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Converts this value to a plain JSON value (without the type tag).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int32(v) => serde_json::json!(*v),
            Value::Int64(v) => serde_json::json!(*v),
            Value::UInt32(v) => serde_json::json!(*v),
            Value::UInt64(v) => serde_json::json!(*v),
            Value::Float32(v) => serde_json::json!(*v),
            Value::Float64(v) => serde_json::json!(*v),
            Value::String(v) => serde_json::Value::String(v.clone()),
            Value::DateTime(dt) => serde_json::json!(dt.to_rfc3339()),
            Value::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Null => write!(f, "null"),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

macro_rules! impl_from_for_value {
    ($variant:ident, $type:ty) => {
        impl From<$type> for Value {
            fn from(v: $type) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_from_for_value!(Bool, bool);
impl_from_for_value!(Int32, i32);
impl_from_for_value!(Int64, i64);
impl_from_for_value!(UInt32, u32);
impl_from_for_value!(UInt64, u64);
impl_from_for_value!(Float32, f32);
impl_from_for_value!(Float64, f64);
impl_from_for_value!(String, String);
impl_from_for_value!(DateTime, DateTime<Utc>);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

// =============================================================================
// DataChangeEvent
// =============================================================================

/// A change of value reported for a monitored node.
///
/// Produced only by the subscription engine, immutable afterwards. The
/// `generation` is the session generation the server-side item belonged to
/// when the notification was received.
///
/// A node monitored at several sampling intervals has one item per interval
/// and every item reports the change; `(node_id, sampling_interval)` names
/// the item an event came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeEvent {
    /// The node that changed.
    pub node_id: NodeId,

    /// The new value.
    pub value: Value,

    /// Timestamp assigned by the data source.
    pub source_timestamp: DateTime<Utc>,

    /// Session generation under which the change was observed.
    pub generation: Generation,

    /// Sampling interval of the reporting item. Zero when not known.
    #[serde(default, rename = "sampling_interval_ms", with = "duration_millis")]
    pub sampling_interval: Duration,
}

impl DataChangeEvent {
    /// Creates a new event.
    pub fn new(
        node_id: impl Into<NodeId>,
        value: impl Into<Value>,
        source_timestamp: DateTime<Utc>,
        generation: Generation,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            value: value.into(),
            source_timestamp,
            generation,
            sampling_interval: Duration::ZERO,
        }
    }

    /// Sets the sampling interval of the reporting item.
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Returns `true` if the event was reported by the item monitoring
    /// `node_id` at `interval`.
    #[inline]
    pub fn is_from(&self, node_id: &NodeId, interval: Duration) -> bool {
        &self.node_id == node_id && self.sampling_interval == interval
    }
}

impl fmt::Display for DataChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={} @ {} (gen {})",
            self.node_id,
            self.value,
            self.source_timestamp.to_rfc3339(),
            self.generation
        )
    }
}

// =============================================================================
// DataChangeListener
// =============================================================================

/// A synchronous consumer of data-change events.
///
/// Listeners are invoked on the ingestion path and must never block: they
/// either enqueue without waiting or drop according to their own policy.
pub trait DataChangeListener: Send + Sync {
    /// Returns the listener name for logging.
    fn name(&self) -> &str;

    /// Delivers one event.
    fn on_data_change(&self, event: &DataChangeEvent);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_node_id() {
        let id = NodeId::new("ns=2;i=1001");
        assert_eq!(id.as_str(), "ns=2;i=1001");
        assert_eq!(id.to_string(), "ns=2;i=1001");
        assert!(!id.is_empty());
        assert!(NodeId::new("  ").is_empty());

        let from_str: NodeId = "ns=2;i=1001".into();
        assert_eq!(id, from_str);
    }

    #[test]
    fn test_value_numeric_view() {
        assert_eq!(Value::Int32(7).as_f64(), Some(7.0));
        assert_eq!(Value::UInt64(9).as_f64(), Some(9.0));
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::String("x".into()).as_f64(), None);
        assert!(Value::Float32(1.5).is_numeric());
        assert!(!Value::Bool(false).is_numeric());
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_value_serde_tagged() {
        let json = serde_json::to_string(&Value::Float64(1.5)).unwrap();
        assert_eq!(json, r#"{"type":"Float64","value":1.5}"#);

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Float64(1.5));

        let null: Value = serde_json::from_str(r#"{"type":"Null"}"#).unwrap();
        assert!(null.is_null());
    }

    #[test]
    fn test_value_to_json() {
        assert_eq!(Value::Int64(-3).to_json(), serde_json::json!(-3));
        assert_eq!(Value::from("on").to_json(), serde_json::json!("on"));
        assert_eq!(Value::Null.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_data_change_event_display() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let event = DataChangeEvent::new("n1", 10.0f64, ts, 2);
        let text = event.to_string();
        assert!(text.starts_with("n1=10 @ 2025-01-01"));
        assert!(text.ends_with("(gen 2)"));
    }

    #[test]
    fn test_data_change_event_item() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let event = DataChangeEvent::new("n1", 1i32, ts, 1)
            .with_sampling_interval(Duration::from_millis(250));

        assert!(event.is_from(&NodeId::new("n1"), Duration::from_millis(250)));
        assert!(!event.is_from(&NodeId::new("n1"), Duration::from_millis(1000)));
        assert!(!event.is_from(&NodeId::new("n2"), Duration::from_millis(250)));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sampling_interval_ms"], 250);
        let legacy = serde_json::json!({
            "node_id": "n1",
            "value": {"type": "Int32", "value": 1},
            "source_timestamp": "2025-01-01T00:00:00Z",
            "generation": 1
        });
        let back: DataChangeEvent = serde_json::from_value(legacy).unwrap();
        assert_eq!(back.sampling_interval, Duration::ZERO);
    }
}
