// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration error types for vigil-config.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors.
///
/// Covers loading, parsing and validating configuration files as well as
/// reading and writing the saved-server registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to parse a configuration or registry file.
    #[error("Failed to parse config file '{path}': {message}")]
    Parse {
        /// Path to the file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Validation failed for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Required field is missing.
    #[error("Missing required field: {field}")]
    MissingField {
        /// The missing field name.
        field: String,
    },

    /// File I/O error.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path to the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Duplicate server ID.
    #[error("Duplicate server ID: {server_id}")]
    DuplicateServerId {
        /// The duplicated server ID.
        server_id: String,
    },

    /// Duplicate tag within a server.
    #[error("Duplicate tag '{node_id}' in server '{server_id}'")]
    DuplicateTag {
        /// The server ID.
        server_id: String,
        /// The duplicated node.
        node_id: String,
    },

    /// Server not present in the registry.
    #[error("Unknown server: {server_id}")]
    UnknownServer {
        /// The requested server ID.
        server_id: String,
    },

    /// Invalid environment variable value.
    #[error("Invalid environment variable value for '{name}': {message}")]
    InvalidEnvVar {
        /// The environment variable name.
        name: String,
        /// Error message.
        message: String,
    },

    /// File not found.
    #[error("File not found: {path}")]
    FileNotFound {
        /// The path that was not found.
        path: PathBuf,
    },

    /// Value out of range.
    #[error("Value out of range for '{field}': {value} (expected {min}..{max})")]
    OutOfRange {
        /// The field name.
        field: String,
        /// The actual value.
        value: String,
        /// Minimum value.
        min: String,
        /// Maximum value.
        max: String,
    },

    /// Unsupported configuration format.
    #[error("Unsupported configuration format: {format}")]
    UnsupportedFormat {
        /// The unsupported format.
        format: String,
    },

    /// Serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates a parse error.
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField { field: field.into() }
    }

    /// Creates an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a duplicate server ID error.
    pub fn duplicate_server_id(server_id: impl Into<String>) -> Self {
        Self::DuplicateServerId {
            server_id: server_id.into(),
        }
    }

    /// Creates a duplicate tag error.
    pub fn duplicate_tag(server_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::DuplicateTag {
            server_id: server_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Creates an unknown server error.
    pub fn unknown_server(server_id: impl Into<String>) -> Self {
        Self::UnknownServer {
            server_id: server_id.into(),
        }
    }

    /// Creates an invalid environment variable error.
    pub fn invalid_env_var(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an out of range error.
    pub fn out_of_range<T: std::fmt::Display>(
        field: impl Into<String>,
        value: T,
        min: T,
        max: T,
    ) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    /// Creates an unsupported format error.
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns a user-friendly error message in Korean.
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::Parse { path, message } => {
                format!("설정 파일 파싱 실패 ({}): {}", path.display(), message)
            }
            ConfigError::Validation { field, message } => {
                format!("설정 검증 실패 ({}): {}", field, message)
            }
            ConfigError::MissingField { field } => {
                format!("필수 설정 누락: {}", field)
            }
            ConfigError::Io { path, .. } => {
                format!("파일 입출력 실패: {}", path.display())
            }
            ConfigError::DuplicateServerId { server_id } => {
                format!("중복된 서버 ID: {}", server_id)
            }
            ConfigError::DuplicateTag { server_id, node_id } => {
                format!("중복된 태그 ({}/{})", server_id, node_id)
            }
            ConfigError::UnknownServer { server_id } => {
                format!("등록되지 않은 서버: {}", server_id)
            }
            ConfigError::InvalidEnvVar { name, message } => {
                format!("잘못된 환경 변수 값 ({}): {}", name, message)
            }
            ConfigError::FileNotFound { path } => {
                format!("파일을 찾을 수 없습니다: {}", path.display())
            }
            ConfigError::OutOfRange { field, value, min, max } => {
                format!(
                    "범위 초과 ({}): {} (허용 범위: {}..{})",
                    field, value, min, max
                )
            }
            ConfigError::UnsupportedFormat { format } => {
                format!("지원하지 않는 설정 형식: {}", format)
            }
            ConfigError::Serialization { message } => {
                format!("직렬화 오류: {}", message)
            }
        }
    }

    /// Returns `true` if this error is related to file I/O.
    pub fn is_io_error(&self) -> bool {
        matches!(
            self,
            ConfigError::Io { .. } | ConfigError::FileNotFound { .. }
        )
    }

    /// Returns the error type as a string for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ConfigError::Parse { .. } => "parse",
            ConfigError::Validation { .. } => "validation",
            ConfigError::MissingField { .. } => "missing_field",
            ConfigError::Io { .. } => "io",
            ConfigError::DuplicateServerId { .. } => "duplicate_server_id",
            ConfigError::DuplicateTag { .. } => "duplicate_tag",
            ConfigError::UnknownServer { .. } => "unknown_server",
            ConfigError::InvalidEnvVar { .. } => "invalid_env_var",
            ConfigError::FileNotFound { .. } => "file_not_found",
            ConfigError::OutOfRange { .. } => "out_of_range",
            ConfigError::UnsupportedFormat { .. } => "unsupported_format",
            ConfigError::Serialization { .. } => "serialization",
        }
    }
}

/// A Result type with ConfigError.
pub type ConfigResult<T> = Result<T, ConfigError>;
