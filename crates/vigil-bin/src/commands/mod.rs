// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! CLI command implementations.
//!
//! - `run`: Start sessions, subscriptions and the historian
//! - `validate`: Validate configuration file
//! - `version`: Show version information

mod run;
mod validate;
mod version;

pub use run::run;
pub use validate::{collect_warnings, validate};
pub use version::version;

use crate::cli::{Cli, Commands};
use crate::error::BinResult;
use crate::logging::init_logging;

/// Executes the appropriate command based on CLI arguments.
///
/// `run` initializes logging from the loaded configuration; the other
/// commands only use the CLI flags.
pub async fn execute(cli: Cli) -> BinResult<()> {
    match cli.effective_command() {
        Commands::Run(args) => run::run(&cli, args).await,
        Commands::Validate(args) => {
            init_cli_logging(&cli);
            validate::validate(&cli, args)
        }
        Commands::Version => version::version(&cli),
    }
}

fn init_cli_logging(cli: &Cli) {
    init_logging(
        cli.effective_log_level("warn"),
        cli.effective_log_format(vigil_config::LogFormat::default()),
    );
}
