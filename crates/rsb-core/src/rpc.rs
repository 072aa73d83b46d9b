// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RPC dispatch through the native rpostback executable.
//!
//! rpostback's console_input call is fire-and-forget relative to actual
//! execution: a `"result"` acknowledgement only means the console queued
//! the input. The call runs under an external `timeout(1)` hard-kill
//! wrapper when one is installed, falling back to an internal timeout
//! with the same bound.

use crate::error::BridgeResult;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Default location of the postback binary on RStudio Server hosts
pub const DEFAULT_POSTBACK_BIN: &str = "/usr/lib/rstudio-server/bin/rpostback";

/// Exit codes the external kill wrapper reports for TERM/KILL
const TIMEOUT_EXIT_CODES: [i32; 2] = [124, 137];

/// Build the console_input JSON-RPC payload addressed at a client id.
pub fn console_input_payload(client_id: &str, code: &str, request_id: u64) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "console_input",
        "clientId": client_id,
        "params": [code, "", 0],
        "id": request_id,
    })
    .to_string()
}

/// Classified outcome of one transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// The console acknowledged and queued the input
    Accepted { raw: String },
    /// rpostback returned a JSON-RPC error object
    ProtocolError { raw: String },
    /// The call hit the hard-kill timeout
    TimedOut,
    /// No acknowledgement and no protocol error; exit status and raw
    /// output are all we have
    Indeterminate { code: i32, raw: String },
}

/// Classify an rpostback exit status plus combined output.
pub fn classify_transport(code: i32, output: &str) -> TransportOutcome {
    if TIMEOUT_EXIT_CODES.contains(&code) {
        return TransportOutcome::TimedOut;
    }
    if output.contains("\"error\"") {
        return TransportOutcome::ProtocolError {
            raw: output.to_string(),
        };
    }
    if output.contains("\"result\"") {
        return TransportOutcome::Accepted {
            raw: output.to_string(),
        };
    }
    TransportOutcome::Indeterminate {
        code,
        raw: output.to_string(),
    }
}

/// Invoker for the native postback executable
pub struct Dispatcher {
    postback_bin: PathBuf,
    log_path: PathBuf,
}

impl Dispatcher {
    pub fn new(postback_bin: Option<PathBuf>) -> Self {
        let postback_bin = postback_bin
            .or_else(|| std::env::var_os("RPOSTBACK_BIN").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POSTBACK_BIN));
        let log_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(".local/share/rstudio/log/rpostback.log");
        Self {
            postback_bin,
            log_path,
        }
    }

    #[cfg(test)]
    fn with_log_path(postback_bin: PathBuf, log_path: PathBuf) -> Self {
        Self {
            postback_bin,
            log_path,
        }
    }

    /// Send one console_input payload under the hard timeout.
    pub async fn dispatch(
        &self,
        payload: &str,
        timeout_secs: u64,
    ) -> BridgeResult<TransportOutcome> {
        let log_mtime_before = file_mtime(&self.log_path);

        let (code, output) = self.run_postback(payload, timeout_secs).await?;
        if !output.is_empty() {
            debug!(rc = code, "rpostback output: {}", output.trim_end());
        }

        let outcome = classify_transport(code, &output);
        if let TransportOutcome::Indeterminate { code, .. } = &outcome {
            if let Some(line) = self.log_tail_since(log_mtime_before) {
                warn!(rc = code, "rpostback failed: {line}");
                let mut detail = format!("rpostback failed (rc={code}): {line}");
                if line.contains("Operation not permitted") {
                    detail.push_str(
                        "\nHint: run outside the sandbox / with elevated permissions so rpostback can reach the local rsession socket.",
                    );
                }
                return Ok(TransportOutcome::Indeterminate {
                    code: *code,
                    raw: detail,
                });
            }
        }
        Ok(outcome)
    }

    async fn run_postback(&self, payload: &str, timeout_secs: u64) -> BridgeResult<(i32, String)> {
        let postback_args = [
            "--command",
            "console_input",
            "--argument",
            payload,
        ];

        if which::which("timeout").is_ok() {
            let mut cmd = tokio::process::Command::new("timeout");
            cmd.args([
                "--foreground",
                "--signal=TERM",
                "--kill-after=2",
                &format!("{timeout_secs}s"),
            ])
            .arg(&self.postback_bin)
            .args(postback_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
            let output = cmd.output().await?;
            let combined = combine_output(&output.stdout, &output.stderr);
            return Ok((output.status.code().unwrap_or(-1), combined));
        }

        // No external wrapper available: enforce the same bound internally.
        let mut cmd = tokio::process::Command::new(&self.postback_bin);
        cmd.args(postback_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
            Ok(output) => {
                let output = output?;
                let combined = combine_output(&output.stdout, &output.stderr);
                Ok((output.status.code().unwrap_or(-1), combined))
            }
            Err(_elapsed) => Ok((124, String::new())),
        }
    }

    /// Surface the last rpostback log line, but only when the log was
    /// written after this call started.
    fn log_tail_since(&self, mtime_before: Option<SystemTime>) -> Option<String> {
        let mtime_after = file_mtime(&self.log_path)?;
        if let Some(before) = mtime_before {
            if mtime_after == before {
                return None;
            }
        }
        let contents = std::fs::read_to_string(&self.log_path).ok()?;
        contents
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_string())
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_matches_console_input_shape() {
        let payload = console_input_payload("client-1", "print(\"hi\")\n1+1", 7);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "console_input");
        assert_eq!(value["clientId"], "client-1");
        assert_eq!(value["params"][0], "print(\"hi\")\n1+1");
        assert_eq!(value["params"][1], "");
        assert_eq!(value["params"][2], 0);
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn exit_124_and_137_classify_as_timeout() {
        assert_eq!(classify_transport(124, ""), TransportOutcome::TimedOut);
        assert_eq!(
            classify_transport(137, "{\"result\":true}"),
            TransportOutcome::TimedOut
        );
    }

    #[test]
    fn error_marker_wins_over_result_marker() {
        let raw = "{\"error\":{\"code\":-32000},\"result\":null}";
        assert!(matches!(
            classify_transport(0, raw),
            TransportOutcome::ProtocolError { .. }
        ));
    }

    #[test]
    fn result_marker_means_accepted() {
        assert!(matches!(
            classify_transport(0, "{\"result\":true}"),
            TransportOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn anything_else_is_indeterminate() {
        assert!(matches!(
            classify_transport(3, "garbled"),
            TransportOutcome::Indeterminate { code: 3, .. }
        ));
    }

    #[tokio::test]
    async fn log_tail_requires_fresh_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("rpostback.log");
        std::fs::write(&log, "old line\nnewest line\n").unwrap();
        let dispatcher = Dispatcher::with_log_path(PathBuf::from("/bin/true"), log.clone());

        let stale = dispatcher.log_tail_since(file_mtime(&log));
        assert_eq!(stale, None);

        let fresh = dispatcher.log_tail_since(None);
        assert_eq!(fresh, Some("newest line".to_string()));
    }
}
