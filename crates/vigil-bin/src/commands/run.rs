// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `run` command.

use tracing::info;

use crate::cli::{Cli, RunArgs};
use crate::error::{BinError, BinResult};
use crate::logging::init_logging;
use crate::runtime::RuntimeBuilder;

/// Executes the `run` command.
pub async fn run(cli: &Cli, args: RunArgs) -> BinResult<()> {
    let config = vigil_config::load_config(&cli.config).map_err(|e| {
        BinError::config(format!(
            "Failed to load config from {}: {}",
            cli.config.display(),
            e
        ))
    })?;

    init_logging(
        cli.effective_log_level(config.logging.level.as_str()),
        cli.effective_log_format(config.logging.format),
    );
    info!(config = %cli.config.display(), "Configuration loaded");

    let runtime = RuntimeBuilder::new()
        .config(config)
        .historian(!args.no_historian)
        .build()?;

    runtime.run().await
}
