// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Common Test Utilities
//!
//! - `fixtures`: Pre-built test data and configurations
//! - `harness`: Wired-up sessions, engines and historians

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;

use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Default upper bound for asynchronous conditions in tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging. Safe to call from every test.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,vigil=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Create a temporary directory for test data.
pub fn temp_test_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("Failed to create temp directory")
}

/// Polls `condition` until it holds, panicking after [`WAIT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            WAIT
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
