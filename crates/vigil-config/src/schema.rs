// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration schema definitions for Vigil.
//!
//! # Schema Structure
//!
//! ```text
//! VigilConfig
//! ├── runtime: RuntimeConfig
//! ├── servers: Vec<ServerConfig>
//! │   ├── security: SecurityDescriptor
//! │   ├── session: SessionConfig (retry: RetryPolicy)
//! │   └── tags: Vec<TagConfig>
//! ├── historian: HistorianConfig
//! ├── fanout: FanoutConfig
//! └── logging: LoggingConfig
//! ```
//!
//! Durations are written in milliseconds.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::fanout::DEFAULT_CONSUMER_CAPACITY;
use vigil_core::serde_helpers::duration_millis;
use vigil_core::types::NodeId;
use vigil_historian::HistorianConfig;
use vigil_opcua::client::{SessionConfig, SubscriptionConfig};
use vigil_opcua::types::{Endpoint, SecurityDescriptor};

use crate::error::{ConfigError, ConfigResult};

// =============================================================================
// Constants
// =============================================================================

/// Default sampling interval of a tag in milliseconds.
pub const DEFAULT_TAG_INTERVAL_MS: u64 = 1000;

/// Minimum sampling interval in milliseconds.
pub const MIN_TAG_INTERVAL_MS: u64 = 1;

/// Maximum sampling interval in milliseconds (1 hour).
pub const MAX_TAG_INTERVAL_MS: u64 = 3_600_000;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// The root configuration structure for Vigil.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VigilConfig {
    /// Process-level settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Remote servers.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Historian settings.
    #[serde(default)]
    pub historian: HistorianConfig,

    /// Live fan-out settings.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VigilConfig {
    /// Validates the entire configuration.
    ///
    /// Server IDs must be unique, and so must the nodes within a server.
    pub fn validate(&self) -> ConfigResult<()> {
        self.runtime.validate()?;

        let mut server_ids = HashSet::new();
        for server in &self.servers {
            if !server_ids.insert(server.id.as_str()) {
                return Err(ConfigError::duplicate_server_id(&server.id));
            }
            server.validate()?;
        }

        self.historian
            .validate()
            .map_err(|message| ConfigError::validation("historian", message))?;
        self.fanout.validate()?;
        self.logging.validate()?;

        Ok(())
    }

    /// Returns a server configuration by ID.
    pub fn get_server(&self, server_id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == server_id)
    }

    /// Returns the enabled servers.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Process-level settings of the `vigil` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Instance identifier used in logs.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Period of the status log line.
    #[serde(
        default = "default_status_interval",
        rename = "status_interval_ms",
        with = "duration_millis"
    )]
    pub status_interval: Duration,

    /// Upper bound on graceful shutdown.
    #[serde(
        default = "default_shutdown_timeout",
        rename = "shutdown_timeout_ms",
        with = "duration_millis"
    )]
    pub shutdown_timeout: Duration,

    /// Period of generated values for simulated servers.
    #[serde(
        default = "default_simulation_period",
        rename = "simulation_period_ms",
        with = "duration_millis"
    )]
    pub simulation_period: Duration,
}

fn default_instance_id() -> String {
    "vigil-01".to_string()
}

fn default_status_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_simulation_period() -> Duration {
    Duration::from_secs(1)
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            status_interval: default_status_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            simulation_period: default_simulation_period(),
        }
    }
}

impl RuntimeConfig {
    /// Validates the runtime configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::validation("runtime.instance_id", "cannot be empty"));
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError::validation(
                "runtime.status_interval_ms",
                "cannot be zero",
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::validation(
                "runtime.shutdown_timeout_ms",
                "cannot be zero",
            ));
        }
        if self.simulation_period.is_zero() {
            return Err(ConfigError::validation(
                "runtime.simulation_period_ms",
                "cannot be zero",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for a single remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unique server identifier.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,

    /// `opc.tcp://host:port[/path]`.
    pub endpoint_url: String,

    /// Security policy, mode and credentials.
    #[serde(default)]
    pub security: SecurityDescriptor,

    /// Whether the server is connected at startup.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Session timing, capacities and reconnect policy.
    #[serde(default)]
    pub session: SessionConfig,

    /// Monitored tags.
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    /// Creates a server entry with default settings and no tags.
    pub fn new(id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            endpoint_url: endpoint_url.into(),
            security: SecurityDescriptor::none(),
            enabled: true,
            session: SessionConfig::default(),
            tags: Vec::new(),
        }
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: TagConfig) -> Self {
        self.tags.push(tag);
        self
    }

    /// Validates the server configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::validation("servers.id", "cannot be empty"));
        }

        self.endpoint().validate().map_err(|e| {
            ConfigError::validation(format!("servers.{}.endpoint_url", self.id), e.to_string())
        })?;
        self.session.validate().map_err(|e| {
            ConfigError::validation(format!("servers.{}.session", self.id), e.to_string())
        })?;

        let mut nodes = HashSet::new();
        for tag in &self.tags {
            if !nodes.insert(tag.node_id.as_str()) {
                return Err(ConfigError::duplicate_tag(&self.id, &tag.node_id));
            }
            tag.validate(&self.id)?;
        }

        Ok(())
    }

    /// Returns the display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Returns the endpoint described by this entry.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.endpoint_url).with_security(self.security.clone())
    }

    /// Returns the tags marked for recording.
    pub fn historized_tags(&self) -> impl Iterator<Item = &TagConfig> {
        self.tags.iter().filter(|t| t.historize)
    }
}

// =============================================================================
// Tag Configuration
// =============================================================================

/// A monitored node of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagConfig {
    /// Node identifier, e.g. `ns=2;s=Line1.Speed`.
    pub node_id: String,

    /// Display name.
    #[serde(default)]
    pub name: Option<String>,

    /// Sampling interval in milliseconds.
    #[serde(default = "default_tag_interval")]
    pub interval_ms: u64,

    /// Whether the historian records this tag.
    #[serde(default)]
    pub historize: bool,
}

fn default_tag_interval() -> u64 {
    DEFAULT_TAG_INTERVAL_MS
}

impl TagConfig {
    /// Creates a tag sampled at the default interval.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            name: None,
            interval_ms: DEFAULT_TAG_INTERVAL_MS,
            historize: false,
        }
    }

    /// Marks the tag for recording.
    pub fn historized(mut self) -> Self {
        self.historize = true;
        self
    }

    /// Validates the tag configuration.
    pub fn validate(&self, server_id: &str) -> ConfigResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::validation(
                format!("servers.{}.tags.node_id", server_id),
                "cannot be empty",
            ));
        }
        if self.interval_ms < MIN_TAG_INTERVAL_MS || self.interval_ms > MAX_TAG_INTERVAL_MS {
            return Err(ConfigError::out_of_range(
                format!("servers.{}.tags.{}.interval_ms", server_id, self.node_id),
                self.interval_ms,
                MIN_TAG_INTERVAL_MS,
                MAX_TAG_INTERVAL_MS,
            ));
        }
        Ok(())
    }

    /// Returns the node identifier.
    pub fn node(&self) -> NodeId {
        NodeId::new(&self.node_id)
    }

    /// Returns the sampling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// =============================================================================
// Fan-out Configuration
// =============================================================================

/// Live distribution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanoutConfig {
    /// Queue capacity of each live consumer.
    #[serde(default = "default_consumer_capacity")]
    pub consumer_capacity: usize,
}

fn default_consumer_capacity() -> usize {
    DEFAULT_CONSUMER_CAPACITY
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            consumer_capacity: default_consumer_capacity(),
        }
    }
}

impl FanoutConfig {
    /// Validates the fan-out configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.consumer_capacity == 0 {
            return Err(ConfigError::validation(
                "fanout.consumer_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Returns the subscription engine settings for this fan-out.
    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig::default().with_consumer_capacity(self.consumer_capacity)
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Log format.
    #[serde(default)]
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Validates the logging configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        Ok(())
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Returns the filter directive for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parses a level name; `warning` is accepted for `warn`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// Compact lines.
    Compact,
    /// JSON lines.
    Json,
}

impl LogFormat {
    /// Returns the format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }

    /// Parses a format name.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "text" | "pretty" => Some(LogFormat::Text),
            "compact" => Some(LogFormat::Compact),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_opcua::types::{SecurityMode, SecurityPolicy};

    fn server() -> ServerConfig {
        ServerConfig::new("plc-01", "opc.tcp://plc-01:4840")
            .with_tag(TagConfig::new("ns=2;s=Speed").historized())
            .with_tag(TagConfig::new("ns=2;s=Mode"))
    }

    #[test]
    fn test_vigil_config_default() {
        let config = VigilConfig::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.runtime.instance_id, "vigil-01");
        assert_eq!(config.fanout.consumer_capacity, DEFAULT_CONSUMER_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_validation() {
        assert!(server().validate().is_ok());

        let mut bad = server();
        bad.endpoint_url = "http://plc-01:4840".to_string();
        assert!(matches!(bad.validate(), Err(ConfigError::Validation { .. })));

        let mut secured = server();
        secured.security = SecurityDescriptor::new(
            SecurityPolicy::Basic256Sha256,
            SecurityMode::SignAndEncrypt,
        );
        assert!(secured.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids() {
        let mut config = VigilConfig::default();
        config.servers = vec![server(), server()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateServerId { .. })
        ));

        let dup_tag = server().with_tag(TagConfig::new("ns=2;s=Speed"));
        assert!(matches!(
            dup_tag.validate(),
            Err(ConfigError::DuplicateTag { .. })
        ));
    }

    #[test]
    fn test_tag_interval_range() {
        let mut tag = TagConfig::new("ns=2;s=Speed");
        tag.interval_ms = 0;
        assert!(matches!(
            tag.validate("plc-01"),
            Err(ConfigError::OutOfRange { .. })
        ));
        tag.interval_ms = 250;
        assert!(tag.validate("plc-01").is_ok());
        assert_eq!(tag.interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_historized_tags() {
        let server = server();
        let nodes: Vec<NodeId> = server.historized_tags().map(TagConfig::node).collect();
        assert_eq!(nodes, vec![NodeId::new("ns=2;s=Speed")]);
        assert_eq!(server.display_name(), "plc-01");
        assert_eq!(server.endpoint().url(), "opc.tcp://plc-01:4840");
    }

    #[test]
    fn test_historian_section_validated() {
        let mut config = VigilConfig::default();
        config.historian.max_batch_events = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { ref field, .. }) if field == "historian"
        ));
    }

    #[test]
    fn test_log_level_and_format() {
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::default().as_str(), "text");
    }
}
