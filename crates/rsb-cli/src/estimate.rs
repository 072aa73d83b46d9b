// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Export timeout estimation.
//!
//! Evaluates `object.size()` of an expression in the live session and
//! prints a suggested wait timeout in seconds for a later export of the
//! same value: `max(5, ceiling(0.5 * size_in_MB + 10))`.

use anyhow::{bail, Result};
use clap::Args;
use rsb_core::codegen::{self, escape_r_string};
use rsb_core::dispatch;
use rsb_core::poll;
use rsb_core::rpc::{self, Dispatcher, TransportOutcome};
use rsb_core::session::{SessionDescriptor, SessionStore};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Args, Clone, Debug)]
pub struct EstimateArgs {
    /// R expression whose export cost to estimate (single line)
    pub expr: String,

    /// Wait timeout for the size result, in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Hard timeout for the RPC send step, in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECONDS", default_value_t = 30)]
    pub rpc_timeout: u64,

    /// Override the active RStudio session directory
    #[arg(long)]
    pub session_dir: Option<PathBuf>,

    /// Override the rpostback binary
    #[arg(long = "rpostback-bin", alias = "postback-bin", env = "RPOSTBACK_BIN")]
    pub rpostback_bin: Option<PathBuf>,
}

/// Fragment measuring the expression's size and writing the suggested
/// timeout (or an `__ERROR__:` marker) to the artifact.
pub fn build_estimate_code(expr: &str, out_path: &Path) -> String {
    let escaped_out = escape_r_string(&out_path.to_string_lossy());
    [
        format!(".rsb_result_out_path <- \"{escaped_out}\""),
        format!(
            ".rsb_result <- tryCatch({{ .rsb_size_mb <- as.numeric(object.size(({expr}))) / (1024^2); max(5, ceiling(0.5 * .rsb_size_mb + 10)) }}, error = function(e) e)"
        ),
        "if (inherits(.rsb_result, \"error\")) {".to_string(),
        "  writeLines(paste0(\"__ERROR__:\", conditionMessage(.rsb_result)), .rsb_result_out_path)"
            .to_string(),
        "} else {".to_string(),
        "  dput(.rsb_result, file = .rsb_result_out_path)".to_string(),
        "}".to_string(),
    ]
    .join("\n")
}

fn validated_expr(expr: &str) -> Result<&str> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        bail!("R expression must not be empty.");
    }
    if trimmed.contains('\n') {
        bail!("R expression must be one line.");
    }
    Ok(trimmed)
}

impl EstimateArgs {
    pub async fn run(self) -> Result<()> {
        let expr = validated_expr(&self.expr)?;

        let store = SessionStore::new();
        let session_dir = store.resolve(self.session_dir.as_deref())?;
        store.load_session_environment(&session_dir);
        let descriptor = SessionDescriptor::read(&session_dir)?;

        // The temp artifact lives as long as this scope; drop deletes it.
        let out = tempfile::Builder::new()
            .prefix("rsb_estimate_")
            .suffix(".txt")
            .tempfile_in(std::env::temp_dir())?
            .into_temp_path();

        let code = build_estimate_code(expr, &out);
        let payload = rpc::console_input_payload(
            &descriptor.client_id,
            &codegen::isolate_fragment(&code),
            1,
        );

        let dispatcher = Dispatcher::new(self.rpostback_bin.clone());
        match dispatcher.dispatch(&payload, self.rpc_timeout).await? {
            TransportOutcome::Accepted { .. } => {}
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

        let contents = poll::await_artifact(
            &out,
            Duration::from_secs(self.timeout),
            poll::POLL_INTERVAL,
        )
        .await?;
        let Some(contents) = contents else {
            bail!("Timed out waiting for result file: {}", out.display());
        };

        let value = dispatch::parse_artifact(&contents)?;
        print!("{value}");
        if !value.ends_with('\n') {
            println!();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: EstimateArgs,
    }

    #[test]
    fn code_applies_the_sizing_formula() {
        let code = build_estimate_code("total", Path::new("/tmp/est.txt"));
        assert!(code.contains("as.numeric(object.size((total))) / (1024^2)"));
        assert!(code.contains("max(5, ceiling(0.5 * .rsb_size_mb + 10))"));
        assert!(code.contains(".rsb_result_out_path <- \"/tmp/est.txt\""));
        assert!(code.contains("__ERROR__:"));
    }

    #[test]
    fn out_path_goes_through_the_escape_path() {
        let code = build_estimate_code("x", Path::new("/tmp/we\"ird.txt"));
        assert!(code.contains(".rsb_result_out_path <- \"/tmp/we\\\"ird.txt\""));
    }

    #[test]
    fn expression_must_be_a_single_nonempty_line() {
        assert!(validated_expr("  ").is_err());
        assert!(validated_expr("list(a = 1,\nb = 2)").is_err());
        assert_eq!(validated_expr(" total ").unwrap(), "total");
    }

    #[test]
    fn defaults_allow_large_objects() {
        let harness = Harness::parse_from(["t", "total"]);
        assert_eq!(harness.args.timeout, 30);
        assert_eq!(harness.args.rpc_timeout, 30);
    }
}
