// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Vigil Integration Tests
//!
//! Cross-crate tests for the Vigil runtime and the helpers they share.
//!
//! ## Module Structure
//!
//! - [`common`]: Shared test utilities
//!   - `fixtures`: Timestamps, events and configuration documents
//!   - `harness`: Simulated server and historian pipelines
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p vigil-tests
//! cargo test -p vigil-tests --test integration_scenarios
//! ```
//!
//! ## Test Categories
//!
//! ### Session Tests (`integration_session.rs`)
//! - Connect, reconnect and generation counting
//! - Background retries against an unreachable endpoint
//! - Subscription replay and fan-out across reconnects
//!
//! ### Historian Tests (`integration_historian.rs`)
//! - Durable batches, resume after restart
//! - Range, bucketed and last-N queries
//!
//! ### Scenario Tests (`integration_scenarios.rs`)
//! - End-to-end recording across a reconnect
//! - Bucketed averages
//!
//! ### Config Tests (`integration_config.rs`)
//! - Parsing, validation and the saved-server registry

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod common;

/// Re-export commonly used items for convenience.
pub mod prelude {
    pub use crate::common::fixtures::*;
    pub use crate::common::harness::*;
    pub use crate::common::{init_test_logging, temp_test_dir, wait_until};
}
