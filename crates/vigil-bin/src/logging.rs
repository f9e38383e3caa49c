// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Logging and tracing initialization.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogFormat;

// =============================================================================
// Logging Initialization
// =============================================================================

/// Initializes the logging subsystem.
///
/// `RUST_LOG` takes precedence over `level`. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
///
/// ```ignore
/// use vigil_bin::cli::LogFormat;
/// use vigil_bin::logging::init_logging;
///
/// init_logging("info", LogFormat::Text);
/// ```
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = build_filter(level);

    let result = match format {
        LogFormat::Text => init_text_logging(filter),
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Compact => init_compact_logging(filter),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match "tokio=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Initializes text-based logging (default).
fn init_text_logging(filter: EnvFilter) -> Result<(), tracing_subscriber::util::TryInitError> {
    let is_terminal = std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(is_terminal),
        )
        .try_init()
}

/// Initializes JSON logging (for production/log aggregation).
fn init_json_logging(filter: EnvFilter) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .try_init()
}

/// Initializes compact logging (minimal output).
fn init_compact_logging(filter: EnvFilter) -> Result<(), tracing_subscriber::util::TryInitError> {
    let is_terminal = std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(is_terminal),
        )
        .try_init()
}

// =============================================================================
// Log Level Parsing
// =============================================================================

/// Parses a log level string into a `Level`.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("Info"), Level::INFO);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug", LogFormat::Compact);
        init_logging("info", LogFormat::Json);
    }
}
