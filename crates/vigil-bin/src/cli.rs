// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! CLI argument parsing and command definitions.
//!
//! - `run`: Start the runtime (default)
//! - `validate`: Validate configuration file
//! - `version`: Show version information

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// =============================================================================
// Main CLI Structure
// =============================================================================

/// Vigil - protocol client runtime for industrial automation servers
///
/// Keeps sessions to remote servers alive, distributes live values and
/// records selected tags to a durable historian.
#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    author = "Sylvex <contact@sylvex.io>",
    version = vigil_core::VERSION,
    about = "Protocol client runtime with live fan-out and historian",
    long_about = None,
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "vigil.yaml",
        env = "VIGIL_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Enable quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

// =============================================================================
// Subcommands
// =============================================================================

/// Available subcommands for the vigil CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start sessions, subscriptions and the historian
    ///
    /// This is the default command when no subcommand is specified.
    Run(RunArgs),

    /// Validate the configuration file
    ///
    /// Parses and validates the configuration file without connecting.
    Validate(ValidateArgs),

    /// Show version information
    Version,
}

// =============================================================================
// Command Arguments
// =============================================================================

/// Arguments for the `run` command.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Do not record history even if the configuration enables it
    #[arg(long)]
    pub no_historian: bool,
}

/// Arguments for the `validate` command.
#[derive(Args, Debug, Clone, Default)]
pub struct ValidateArgs {
    /// Show parsed configuration after validation
    #[arg(short, long)]
    pub show_config: bool,

    /// Output format for validation results
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Strict mode: treat warnings as errors
    #[arg(long)]
    pub strict: bool,
}

// =============================================================================
// Enums
// =============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
    /// Compact format for minimal output
    Compact,
}

impl From<vigil_config::LogFormat> for LogFormat {
    fn from(format: vigil_config::LogFormat) -> Self {
        match format {
            vigil_config::LogFormat::Text => LogFormat::Text,
            vigil_config::LogFormat::Compact => LogFormat::Compact,
            vigil_config::LogFormat::Json => LogFormat::Json,
        }
    }
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for programmatic parsing
    Json,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl Cli {
    /// Parse CLI arguments from the command line.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the effective command, defaulting to `Run` if none specified.
    pub fn effective_command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or_else(|| Commands::Run(RunArgs::default()))
    }

    /// Check if verbose logging is enabled.
    pub fn is_verbose(&self) -> bool {
        self.verbose && !self.quiet
    }

    /// Returns the log level: flags first, then `--log-level`, then the
    /// configured level.
    pub fn effective_log_level<'a>(&'a self, configured: &'a str) -> &'a str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            self.log_level.as_deref().unwrap_or(configured)
        }
    }

    /// Returns the log format: `--log-format`, then the configured format.
    pub fn effective_log_format(&self, configured: vigil_config::LogFormat) -> LogFormat {
        self.log_format.unwrap_or_else(|| configured.into())
    }
}

// =============================================================================
// Tests
// =============================================================================
