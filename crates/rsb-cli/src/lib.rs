// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use rsb_logging::CliLoggingArgs;

pub mod estimate;
pub mod raw;
pub mod repl;

pub use clap::Parser;

#[derive(clap::Parser)]
#[command(
    name = "rsb",
    about = "RStudio console bridge",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: CliLoggingArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Single-shot low-level console_input send, bypassing the capability
    /// REPL entirely
    Raw(raw::RawArgs),
    /// Suggest an export wait timeout from an expression's in-session size
    Estimate(estimate::EstimateArgs),
}
