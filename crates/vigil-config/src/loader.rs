// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration loading for Vigil.
//!
//! # Loading Pipeline
//!
//! 1. Read the file
//! 2. Resolve `${VAR}` / `${VAR:default}` placeholders
//! 3. Parse as YAML, TOML or JSON (by extension)
//! 4. Apply `VIGIL_*` environment overrides
//! 5. Resolve relative paths against the file's directory
//! 6. Validate
//!
//! # Environment Variable Override
//!
//! ```text
//! VIGIL_INSTANCE_ID=edge-07
//! VIGIL_LOG_LEVEL=debug
//! VIGIL_LOG_FORMAT=json
//! VIGIL_HISTORIAN_ENABLED=false
//! VIGIL_HISTORIAN_DATA_DIR=/var/lib/vigil/history
//! VIGIL_SERVERS_0_ENABLED=false
//! VIGIL_SERVERS_0_ENDPOINT_URL=opc.tcp://10.0.0.5:4840
//! ```

use crate::error::{ConfigError, ConfigResult};
use crate::schema::{LogFormat, LogLevel, VigilConfig};
use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default environment variable prefix.
pub const DEFAULT_ENV_PREFIX: &str = "VIGIL";

// =============================================================================
// ConfigLoader
// =============================================================================

/// Configuration loader for Vigil.
///
/// # Examples
///
/// ```no_run
/// use vigil_config::loader::ConfigLoader;
///
/// let loader = ConfigLoader::new();
/// let config = loader.load("vigil.yaml").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Base directory for resolving relative paths.
    base_path: Option<PathBuf>,

    /// Environment variable prefix.
    env_prefix: String,

    /// Whether to resolve environment variables.
    resolve_env_vars: bool,

    /// Whether to resolve relative paths.
    resolve_paths: bool,
}

impl ConfigLoader {
    /// Creates a new configuration loader with default settings.
    pub fn new() -> Self {
        Self {
            base_path: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            resolve_env_vars: true,
            resolve_paths: true,
        }
    }

    /// Creates a builder for configuring the loader.
    pub fn builder() -> ConfigLoaderBuilder {
        ConfigLoaderBuilder::new()
    }

    /// Sets the base path for resolving relative paths.
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Sets the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Enables or disables environment variable resolution.
    pub fn with_env_vars(mut self, enabled: bool) -> Self {
        self.resolve_env_vars = enabled;
        self
    }

    /// Enables or disables relative path resolution.
    pub fn with_path_resolution(mut self, enabled: bool) -> Self {
        self.resolve_paths = enabled;
        self
    }

    /// Loads configuration from a file.
    ///
    /// The file format is determined by the file extension:
    /// - `.yaml` or `.yml` - YAML format
    /// - `.toml` - TOML format
    /// - `.json` - JSON format
    pub fn load(&self, path: impl AsRef<Path>) -> ConfigResult<VigilConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let base_path = self.base_path.clone().unwrap_or_else(|| {
            path.parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        });

        let content = self.read_file(path)?;
        let format = ConfigFormat::from_path(path)?;
        let mut config = self.parse_content(&content, format, path)?;

        if self.resolve_env_vars {
            self.apply_env_overrides(&mut config)?;
        }

        if self.resolve_paths {
            self.resolve_relative_paths(&mut config, &base_path);
        }

        config.validate()?;

        info!("Configuration loaded successfully");
        debug!(
            servers = config.servers.len(),
            tags = config.servers.iter().map(|s| s.tags.len()).sum::<usize>(),
            "Configuration summary"
        );

        Ok(config)
    }

    /// Loads configuration from a string.
    pub fn load_from_str(&self, content: &str, format: ConfigFormat) -> ConfigResult<VigilConfig> {
        let content = if self.resolve_env_vars {
            self.resolve_env_placeholders(content)
        } else {
            content.to_string()
        };
        let mut config = parse_str(&content, format)?;

        if self.resolve_env_vars {
            self.apply_env_overrides(&mut config)?;
        }

        config.validate()?;

        Ok(config)
    }

    fn read_file(&self, path: &Path) -> ConfigResult<String> {
        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))
    }

    fn parse_content(
        &self,
        content: &str,
        format: ConfigFormat,
        path: &Path,
    ) -> ConfigResult<VigilConfig> {
        let content = if self.resolve_env_vars {
            self.resolve_env_placeholders(content)
        } else {
            content.to_string()
        };

        parse_str(&content, format).map_err(|e| match e {
            ConfigError::Serialization { message } => ConfigError::parse(path, message),
            other => other,
        })
    }

    /// Resolves `${VAR_NAME}` and `${VAR_NAME:default}` placeholders.
    ///
    /// An unset variable without a default is kept verbatim.
    fn resolve_env_placeholders(&self, content: &str) -> String {
        let mut result = String::with_capacity(content.len());
        let mut chars = content.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' || chars.peek() != Some(&'{') {
                result.push(c);
                continue;
            }
            chars.next();

            let mut var_content = String::new();
            let mut found_close = false;
            for c in chars.by_ref() {
                if c == '}' {
                    found_close = true;
                    break;
                }
                var_content.push(c);
            }

            if !found_close {
                result.push_str("${");
                result.push_str(&var_content);
                continue;
            }

            let (var_name, default_value) = match var_content.split_once(':') {
                Some((name, default)) => (name, Some(default)),
                None => (var_content.as_str(), None),
            };

            match env::var(var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => match default_value {
                    Some(default) => result.push_str(default),
                    None => {
                        warn!(variable = var_name, "Environment variable not found");
                        result.push_str(&format!("${{{}}}", var_name));
                    }
                },
            }
        }

        result
    }

    fn env_var(&self, suffix: &str) -> Option<(String, String)> {
        let name = format!("{}_{}", self.env_prefix, suffix);
        env::var(&name).ok().map(|value| (name, value))
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&self, config: &mut VigilConfig) -> ConfigResult<()> {
        if let Some((_, value)) = self.env_var("INSTANCE_ID") {
            config.runtime.instance_id = value;
        }

        if let Some((name, value)) = self.env_var("LOG_LEVEL") {
            config.logging.level = LogLevel::parse(&value)
                .ok_or_else(|| ConfigError::invalid_env_var(name, "expected trace|debug|info|warn|error"))?;
        }
        if let Some((name, value)) = self.env_var("LOG_FORMAT") {
            config.logging.format = LogFormat::parse(&value)
                .ok_or_else(|| ConfigError::invalid_env_var(name, "expected text|compact|json"))?;
        }

        if let Some((_, value)) = self.env_var("HISTORIAN_ENABLED") {
            config.historian.enabled = parse_bool(&value);
        }
        if let Some((_, value)) = self.env_var("HISTORIAN_DATA_DIR") {
            config.historian.data_dir = PathBuf::from(value);
        }

        for i in 0..config.servers.len() {
            if let Some((_, value)) = self.env_var(&format!("SERVERS_{}_ENABLED", i)) {
                config.servers[i].enabled = parse_bool(&value);
            }
            if let Some((_, value)) = self.env_var(&format!("SERVERS_{}_ENDPOINT_URL", i)) {
                config.servers[i].endpoint_url = value;
            }
        }

        Ok(())
    }

    /// Resolves relative paths in configuration.
    fn resolve_relative_paths(&self, config: &mut VigilConfig, base_path: &Path) {
        if config.historian.data_dir.is_relative() {
            config.historian.data_dir = base_path.join(&config.historian.data_dir);
        }

        for server in &mut config.servers {
            if let Some(ref mut cert_path) = server.security.certificate_path {
                if cert_path.is_relative() {
                    *cert_path = base_path.join(&cert_path);
                }
            }
            if let Some(ref mut key_path) = server.security.private_key_path {
                if key_path.is_relative() {
                    *key_path = base_path.join(&key_path);
                }
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ConfigLoaderBuilder
// =============================================================================

/// Builder for ConfigLoader.
#[derive(Debug, Default)]
pub struct ConfigLoaderBuilder {
    base_path: Option<PathBuf>,
    env_prefix: Option<String>,
    resolve_env_vars: Option<bool>,
    resolve_paths: Option<bool>,
}

impl ConfigLoaderBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base path.
    pub fn base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Sets the environment prefix.
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Enables or disables environment variable resolution.
    pub fn resolve_env_vars(mut self, enabled: bool) -> Self {
        self.resolve_env_vars = Some(enabled);
        self
    }

    /// Enables or disables path resolution.
    pub fn resolve_paths(mut self, enabled: bool) -> Self {
        self.resolve_paths = Some(enabled);
        self
    }

    /// Builds the ConfigLoader.
    pub fn build(self) -> ConfigLoader {
        let mut loader = ConfigLoader::new();

        if let Some(base_path) = self.base_path {
            loader.base_path = Some(base_path);
        }
        if let Some(prefix) = self.env_prefix {
            loader.env_prefix = prefix;
        }
        if let Some(resolve_env_vars) = self.resolve_env_vars {
            loader.resolve_env_vars = resolve_env_vars;
        }
        if let Some(resolve_paths) = self.resolve_paths {
            loader.resolve_paths = resolve_paths;
        }

        loader
    }
}

// =============================================================================
// ConfigFormat
// =============================================================================

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format.
    Yaml,
    /// TOML format.
    Toml,
    /// JSON format.
    Json,
}

impl ConfigFormat {
    /// Determines the format from a file path.
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            Some(other) => Err(ConfigError::unsupported_format(other)),
            None => Err(ConfigError::unsupported_format("(no extension)")),
        }
    }

    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yaml",
            ConfigFormat::Toml => "toml",
            ConfigFormat::Json => "json",
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_str<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> ConfigResult<T> {
    match format {
        ConfigFormat::Yaml => parse_yaml(content),
        ConfigFormat::Toml => {
            toml::from_str(content).map_err(|e| ConfigError::serialization(e.to_string()))
        }
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::serialization(e.to_string()))
        }
    }
}

/// YAML goes through the `config` crate.
fn parse_yaml<T: DeserializeOwned>(content: &str) -> ConfigResult<T> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(content, config::FileFormat::Yaml))
        .build()
        .map_err(|e| ConfigError::serialization(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::serialization(e.to_string()))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "enabled"
    )
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Loads configuration from a file with default settings.
///
/// ```no_run
/// use vigil_config::loader::load_config;
///
/// let config = load_config("vigil.yaml").unwrap();
/// ```
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<VigilConfig> {
    ConfigLoader::new().load(path)
}

/// Loads configuration from a string with the specified format.
pub fn load_config_str(content: &str, format: ConfigFormat) -> ConfigResult<VigilConfig> {
    ConfigLoader::new().load_from_str(content, format)
}

// =============================================================================
// Tests
// =============================================================================
