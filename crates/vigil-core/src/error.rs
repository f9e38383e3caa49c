// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Unified error hierarchy for Vigil.
//!
//! # Error Hierarchy
//!
//! ```text
//! VigilError (root)
//! ├── SessionError    - Connection, protocol and subscription failures
//! ├── HistorianError  - Durable batch writes and buffer overflow
//! └── QueryError      - Trend query arguments and storage access
//! ```
//!
//! Transport-level failures (`Connection`, `Timeout`) are normally absorbed by
//! the session state machine; callers see them as state transitions. Errors
//! caused by the caller (bad arguments, operating on a disconnected session)
//! are returned synchronously.
//!
//! # Examples
//!
//! ```
//! use vigil_core::error::{VigilError, SessionError};
//! use std::time::Duration;
//!
//! let error = SessionError::timeout(Duration::from_secs(5));
//! assert!(error.is_retryable());
//! assert!(error.is_transport_failure());
//!
//! let root: VigilError = error.into();
//! assert_eq!(root.error_type(), "session");
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::NodeId;

// =============================================================================
// VigilError - Root Error Type
// =============================================================================

/// The root error type for Vigil.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Session or subscription error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Historian error.
    #[error("Historian error: {0}")]
    Historian(#[from] HistorianError),

    /// Trend query error.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),
}

impl VigilError {
    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            VigilError::Session(e) => e.is_retryable(),
            VigilError::Historian(e) => e.is_retryable(),
            VigilError::Query(_) => false,
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            VigilError::Session(e) => format!("서버 통신 오류: {}", e.user_message()),
            VigilError::Historian(e) => format!("이력 저장 오류: {}", e.user_message()),
            VigilError::Query(e) => format!("트렌드 조회 오류: {}", e.user_message()),
        }
    }

    /// Returns the error type as a string for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            VigilError::Session(_) => "session",
            VigilError::Historian(_) => "historian",
            VigilError::Query(_) => "query",
        }
    }
}

/// Result type alias using [`VigilError`].
pub type VigilResult<T> = Result<T, VigilError>;

// =============================================================================
// SessionError
// =============================================================================

/// Session, transport and subscription errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The endpoint could not be reached or the connection dropped.
    #[error("Connection failed: {message}")]
    Connection {
        /// Error message.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A transport operation did not complete in time.
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// The timeout duration.
        duration: Duration,
    },

    /// The session is not in the `Connected` state.
    #[error("Session is not connected (state: {state})")]
    NotConnected {
        /// The state the session was in.
        state: String,
    },

    /// The server sent a malformed or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// A monitored item could not be restored after a reconnect.
    #[error("Failed to recreate monitored item '{node_id}': {message}")]
    ItemRecreationFailed {
        /// The node whose item could not be recreated.
        node_id: NodeId,
        /// Error message.
        message: String,
    },

    /// The requested operation is not allowed in the current state.
    #[error("Operation not allowed in state {state}: {message}")]
    InvalidState {
        /// The current state.
        state: String,
        /// Error message.
        message: String,
    },

    /// An argument supplied by the caller is invalid.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// The retry policy gave up reconnecting.
    #[error("Reconnection abandoned after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

impl SessionError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a connection error with a source.
    pub fn connection_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Creates a not connected error.
    pub fn not_connected(state: impl ToString) -> Self {
        Self::NotConnected {
            state: state.to_string(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an item recreation failure.
    pub fn item_recreation_failed(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::ItemRecreationFailed {
            node_id,
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(state: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Connection { .. } | SessionError::Timeout { .. }
        )
    }

    /// Returns `true` if this error means the transport itself is unusable.
    ///
    /// Such failures move a connected session to `Reconnecting`.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Connection { .. } | SessionError::Timeout { .. }
        )
    }

    /// Returns the error type for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            SessionError::Connection { .. } => "connection",
            SessionError::Timeout { .. } => "timeout",
            SessionError::NotConnected { .. } => "not_connected",
            SessionError::Protocol { .. } => "protocol",
            SessionError::ItemRecreationFailed { .. } => "item_recreation_failed",
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::InvalidArgument { .. } => "invalid_argument",
            SessionError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Connection { .. } => "서버 연결에 실패했습니다".to_string(),
            SessionError::Timeout { duration } => {
                format!("응답 시간 초과 ({:.1}초)", duration.as_secs_f64())
            }
            SessionError::NotConnected { .. } => "서버가 연결되어 있지 않습니다".to_string(),
            SessionError::Protocol { message } => format!("프로토콜 오류: {}", message),
            SessionError::ItemRecreationFailed { node_id, .. } => {
                format!("구독 항목 복구 실패: {}", node_id)
            }
            SessionError::InvalidState { state, .. } => {
                format!("현재 상태({})에서는 요청을 처리할 수 없습니다", state)
            }
            SessionError::InvalidArgument { message } => format!("잘못된 요청: {}", message),
            SessionError::RetriesExhausted { attempts } => {
                format!("재연결 시도 한도 초과 ({}회)", attempts)
            }
        }
    }
}

impl Clone for SessionError {
    fn clone(&self) -> Self {
        match self {
            SessionError::Connection { message, .. } => SessionError::Connection {
                message: message.clone(),
                source: None,
            },
            SessionError::Timeout { duration } => SessionError::Timeout {
                duration: *duration,
            },
            SessionError::NotConnected { state } => SessionError::NotConnected {
                state: state.clone(),
            },
            SessionError::Protocol { message } => SessionError::Protocol {
                message: message.clone(),
            },
            SessionError::ItemRecreationFailed { node_id, message } => {
                SessionError::ItemRecreationFailed {
                    node_id: node_id.clone(),
                    message: message.clone(),
                }
            }
            SessionError::InvalidState { state, message } => SessionError::InvalidState {
                state: state.clone(),
                message: message.clone(),
            },
            SessionError::InvalidArgument { message } => SessionError::InvalidArgument {
                message: message.clone(),
            },
            SessionError::RetriesExhausted { attempts } => SessionError::RetriesExhausted {
                attempts: *attempts,
            },
        }
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// HistorianError
// =============================================================================

/// Historian buffer and durable sink errors.
#[derive(Debug, Error)]
pub enum HistorianError {
    /// The durable sink rejected a batch.
    #[error("Sink write failed: {message}")]
    SinkWrite {
        /// Error message.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Buffered events exceeded the retention bound and were dropped.
    #[error("Historian overflow: dropped {dropped} events (max {max})")]
    Overflow {
        /// Number of events dropped.
        dropped: u64,
        /// Configured retention bound.
        max: u64,
    },

    /// A persisted batch file could not be decoded.
    #[error("Corrupted batch '{path}': {message}")]
    CorruptedBatch {
        /// Path of the batch file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Reading persisted history failed.
    #[error("Read failed: {message}")]
    Read {
        /// Error message.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Encoding a batch failed.
    #[error("Serialization failed: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },

    /// The historian configuration is unusable.
    #[error("Invalid historian configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// The historian is not running.
    #[error("Historian is not running")]
    NotRunning,

    /// The historian is already running.
    #[error("Historian is already running")]
    AlreadyRunning,
}

impl HistorianError {
    /// Creates a sink write error.
    pub fn sink_write(message: impl Into<String>) -> Self {
        Self::SinkWrite {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a sink write error from an I/O failure.
    pub fn sink_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SinkWrite {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a read error.
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a read error from an I/O failure.
    pub fn read_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Read {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an overflow error.
    pub fn overflow(dropped: u64, max: u64) -> Self {
        Self::Overflow { dropped, max }
    }

    /// Creates a corrupted batch error.
    pub fn corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CorruptedBatch {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HistorianError::SinkWrite { .. })
    }

    /// Returns the error type for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            HistorianError::SinkWrite { .. } => "sink_write",
            HistorianError::Overflow { .. } => "overflow",
            HistorianError::CorruptedBatch { .. } => "corrupted_batch",
            HistorianError::Read { .. } => "read",
            HistorianError::Serialization { .. } => "serialization",
            HistorianError::InvalidConfig { .. } => "invalid_config",
            HistorianError::NotRunning => "not_running",
            HistorianError::AlreadyRunning => "already_running",
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            HistorianError::SinkWrite { .. } => "이력 파일 저장에 실패했습니다".to_string(),
            HistorianError::Overflow { dropped, max } => {
                format!("이력 버퍼 초과로 {}건이 삭제되었습니다 (최대 {})", dropped, max)
            }
            HistorianError::CorruptedBatch { path, .. } => {
                format!("이력 파일이 손상되었습니다: {}", path.display())
            }
            HistorianError::Read { .. } => "이력 파일을 읽지 못했습니다".to_string(),
            HistorianError::Serialization { .. } => "이력 데이터 변환에 실패했습니다".to_string(),
            HistorianError::InvalidConfig { message } => format!("이력 설정 오류: {}", message),
            HistorianError::NotRunning => "이력 수집이 실행 중이 아닙니다".to_string(),
            HistorianError::AlreadyRunning => "이력 수집이 이미 실행 중입니다".to_string(),
        }
    }
}

/// Result type alias for historian operations.
pub type HistorianResult<T> = Result<T, HistorianError>;

// =============================================================================
// QueryError
// =============================================================================

/// Trend query errors.
///
/// An empty result is not an error: queries over ranges without data
/// return empty sequences.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query window is inverted.
    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange {
        /// Window start (RFC 3339).
        start: String,
        /// Window end (RFC 3339).
        end: String,
    },

    /// The bucket width is not usable.
    #[error("Invalid bucket: {message}")]
    InvalidBucket {
        /// Error message.
        message: String,
    },

    /// Reading persisted history failed.
    #[error("Storage error: {0}")]
    Storage(#[from] HistorianError),
}

impl QueryError {
    /// Creates an invalid range error.
    pub fn invalid_range(start: impl ToString, end: impl ToString) -> Self {
        Self::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    /// Creates an invalid bucket error.
    pub fn invalid_bucket(message: impl Into<String>) -> Self {
        Self::InvalidBucket {
            message: message.into(),
        }
    }

    /// Returns the error type for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            QueryError::InvalidRange { .. } => "invalid_range",
            QueryError::InvalidBucket { .. } => "invalid_bucket",
            QueryError::Storage(_) => "storage",
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            QueryError::InvalidRange { .. } => "조회 기간이 올바르지 않습니다".to_string(),
            QueryError::InvalidBucket { message } => format!("집계 구간 오류: {}", message),
            QueryError::Storage(e) => e.user_message(),
        }
    }
}

/// Result type alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

// =============================================================================
// Tests
// =============================================================================
