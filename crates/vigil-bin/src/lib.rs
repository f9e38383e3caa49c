// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vigil-bin
//!
//! CLI binary for the Vigil protocol client runtime.
//!
//! - CLI argument parsing with clap
//! - Runtime orchestration: sessions, subscriptions, historian
//! - Graceful shutdown handling
//! - Logging initialization
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         main.rs                              │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │
//!                    ┌──────▼──────┐
//!                    │    cli.rs   │
//!                    └──────┬──────┘
//!                           │
//!               ┌───────────┼───────────┐
//!               ▼           ▼           ▼
//!        ┌──────────┐ ┌──────────┐ ┌──────────┐
//!        │ commands │ │ runtime  │ │ logging  │
//!        └──────────┘ └────┬─────┘ └──────────┘
//!                          │
//!          ┌───────────────┼────────────────┐
//!          ▼               ▼                ▼
//!   ┌───────────────┐ ┌──────────────┐ ┌─────────────┐
//!   │ ServerSession │ │ Subscription │ │  Historian  │
//!   │  (per server) │ │    Engine    │ │  Recorder   │
//!   └───────────────┘ └──────────────┘ └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the runtime (default command)
//! vigil
//!
//! # Start with custom config, without recording
//! vigil -c /etc/vigil/vigil.yaml run --no-historian
//!
//! # Validate configuration
//! vigil validate --strict
//!
//! # Show version
//! vigil version
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod shutdown;

// =============================================================================
// Re-exports
// =============================================================================

pub use cli::{Cli, Commands};
pub use error::{BinError, BinResult};
pub use logging::init_logging;
pub use runtime::{RuntimeBuilder, VigilRuntime};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
