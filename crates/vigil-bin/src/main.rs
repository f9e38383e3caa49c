// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Vigil - protocol client runtime for industrial automation servers.

use vigil_bin::cli::Cli;
use vigil_bin::commands;
use vigil_bin::error::report_error_and_exit;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = commands::execute(cli).await {
        report_error_and_exit(e);
    }
}
