// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Failures of the vigil binary and their process exit codes.

use thiserror::Error;
use vigil_core::{HistorianError, SessionError};

/// Result type alias for vigil-bin operations.
pub type BinResult<T> = Result<T, BinError>;

/// Why the binary stopped.
#[derive(Debug, Error)]
pub enum BinError {
    /// The configuration file is missing, unreadable or rejected.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A validation report could not be rendered.
    #[error("cannot render report: {0}")]
    Report(String),

    /// A server session or its subscription engine could not be set up.
    #[error("server session failed: {0}")]
    Session(#[from] SessionError),

    /// The historian could not be opened or started.
    #[error("historian failed: {0}")]
    Historian(#[from] HistorianError),

    /// A failure attributed to one server.
    #[error("{context}: {source}")]
    WithContext {
        /// Server the failure belongs to.
        context: String,
        /// The failure.
        #[source]
        source: Box<BinError>,
    },
}

impl BinError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a report rendering error.
    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }

    /// Prefixes the error with `context`.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Session(_) => 2,
            Self::Historian(_) => 3,
            Self::Report(_) => 4,
            Self::WithContext { source, .. } => source.exit_code(),
        }
    }
}

/// Prints the error and its causes on stderr.
pub fn report_error(error: &BinError) {
    eprintln!("Error: {}", error);

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("  Caused by: {}", cause);
        source = cause.source();
    }
}

/// Prints the error and exits with its code.
pub fn report_error_and_exit(error: BinError) -> ! {
    report_error(&error);
    std::process::exit(error.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_context_keeps_exit_code() {
        let err = BinError::from(HistorianError::NotRunning).with_context("server 'plc-1'");
        assert!(err.to_string().starts_with("server 'plc-1': historian failed: "));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BinError::config("no servers").exit_code(), 1);
        assert_eq!(
            BinError::from(SessionError::invalid_argument("empty endpoint")).exit_code(),
            2
        );
        assert_eq!(BinError::report("closed pipe").exit_code(), 4);
        assert_eq!(
            BinError::config("no servers").to_string(),
            "invalid configuration: no servers"
        );
    }
}
