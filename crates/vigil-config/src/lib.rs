// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vigil-config
//!
//! Configuration management for the Vigil protocol client runtime.
//!
//! ## Features
//!
//! - **Schema Definition**: servers, tags, historian, fan-out and logging
//! - **Multi-Format Support**: YAML, TOML, and JSON configuration files
//! - **Environment Overrides**: `VIGIL_*` variables and `${VAR:default}` placeholders
//! - **Saved-Server Registry**: named servers and their tags in one JSON document
//!
//! ## Quick Start
//!
//! ```no_run
//! use vigil_config::loader::load_config;
//!
//! let config = load_config("vigil.yaml").unwrap();
//!
//! println!("Instance: {}", config.runtime.instance_id);
//! println!("Servers: {}", config.servers.len());
//! ```
//!
//! ## Example
//!
//! ```yaml
//! servers:
//!   - id: plc-01
//!     endpoint_url: "${PLC_URL:opc.tcp://localhost:4840}"
//!     session:
//!       retry: { base_delay: 500, max_delay: 30000 }
//!     tags:
//!       - { node_id: "ns=2;s=Line1.Speed", interval_ms: 500, historize: true }
//!
//! historian:
//!   data_dir: ./data/history
//!   max_batch_events: 500
//!   max_batch_latency_ms: 1000
//!
//! logging:
//!   level: info
//!   format: json
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod error;
pub mod loader;
pub mod registry;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, load_config_str, ConfigFormat, ConfigLoader, ConfigLoaderBuilder};
pub use registry::{SavedServer, SavedTag, ServerRegistry};
pub use schema::{
    FanoutConfig, LogFormat, LogLevel, LoggingConfig, RuntimeConfig, ServerConfig, TagConfig,
    VigilConfig,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
