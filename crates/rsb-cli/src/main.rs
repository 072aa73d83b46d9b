// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::Result;
use rsb_cli::{Cli, Commands, Parser};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("rsb")?;

    match cli.command {
        Some(Commands::Raw(args)) => args.run().await,
        Some(Commands::Estimate(args)) => args.run().await,
        None => rsb_cli::repl::run().await,
    }
}
