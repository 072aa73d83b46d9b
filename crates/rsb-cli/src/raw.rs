// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Low-level single-shot console_input send.
//!
//! No capability validation and no result artifact: the given code is
//! pushed straight into the console, optionally wrapped in a scratch
//! environment. Meant for debugging the transport, not for normal use.

use anyhow::{bail, Result};
use clap::Args;
use rsb_core::codegen;
use rsb_core::rpc::{self, Dispatcher, TransportOutcome};
use rsb_core::session::{SessionDescriptor, SessionStore};
use std::path::PathBuf;

fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(format!("invalid value: {other} (use 0 or 1)")),
    }
}

#[derive(Args, Clone, Debug)]
pub struct RawArgs {
    /// R code to push into the console
    #[arg(long)]
    pub code: String,

    /// Override the active RStudio session directory
    #[arg(long)]
    pub session_dir: Option<PathBuf>,

    /// JSON-RPC request id
    #[arg(long, default_value_t = 1)]
    pub id: u64,

    /// Override the rpostback binary
    #[arg(long = "rpostback-bin", alias = "postback-bin", env = "RPOSTBACK_BIN")]
    pub rpostback_bin: Option<PathBuf>,

    /// Wrap the code in a scratch environment before sending
    #[arg(long, value_parser = parse_switch, default_value = "1", action = clap::ArgAction::Set)]
    pub isolate_code: bool,

    /// Hard timeout for the RPC send step, in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECONDS", default_value_t = 12)]
    pub rpc_timeout: u64,
}

impl RawArgs {
    pub async fn run(self) -> Result<()> {
        if self.code.trim().is_empty() {
            bail!("--code must not be empty");
        }

        let store = SessionStore::new();
        let session_dir = store.resolve(self.session_dir.as_deref())?;
        store.load_session_environment(&session_dir);
        let descriptor = SessionDescriptor::read(&session_dir)?;

        let code = if self.isolate_code {
            codegen::isolate_fragment(&self.code)
        } else {
            self.code.clone()
        };
        let payload = rpc::console_input_payload(&descriptor.client_id, &code, self.id);

        let dispatcher = Dispatcher::new(self.rpostback_bin.clone());
        match dispatcher.dispatch(&payload, self.rpc_timeout).await? {
            TransportOutcome::Accepted { raw } => {
                print!("{raw}");
                Ok(())
            }
            TransportOutcome::TimedOut => {
                bail!("RPC send timed out after {}s.", self.rpc_timeout)
            }
            TransportOutcome::ProtocolError { raw } => {
                bail!("JSON-RPC error returned for console_input: {}", raw.trim())
            }
            TransportOutcome::Indeterminate { code, raw } => {
                bail!("rpostback failed (rc={code}): {}", raw.trim())
            }
        }
    }
}
