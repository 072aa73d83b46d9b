// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Offline parse check of the synthesized fragment.
//!
//! Runs `Rscript -e 'parse(file = ...)'` against a temp copy of the code
//! before anything touches the transport. A parse failure is terminal:
//! the diagnostic (plus a small source window) is surfaced, and written
//! into the result artifact when one is expected so downstream consumers
//! still observe a terminal outcome.

use crate::codegen::escape_r_string;
use crate::error::{BridgeError, BridgeResult};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

/// Marker line prefixing a pre-flight parse failure in the artifact
pub const SYNTAX_ERROR_MARKER: &str = "__SYNTAX_ERROR__";

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\d+):(\d+):").expect("static pattern"))
}

/// Pull the offending line number out of an R parse diagnostic.
pub fn extract_parse_error_line(parse_output: &str) -> Option<usize> {
    for line in parse_output.lines() {
        if let Some(caps) = location_re().captures(line) {
            return caps[1].parse().ok();
        }
    }
    None
}

/// Render a context window around the offending line, with a
/// `>> NNNN:` marker on the failing line.
pub fn format_parse_error_snippet(r_code: &str, line_no: usize, context: usize) -> String {
    let lines: Vec<&str> = r_code.lines().collect();
    if line_no < 1 || lines.is_empty() {
        return String::new();
    }
    let start = line_no.saturating_sub(context).max(1);
    let end = (line_no + context).min(lines.len());
    let mut block = vec!["R snippet around parse error:".to_string()];
    for idx in start..=end {
        let marker = if idx == line_no { ">>" } else { "  " };
        block.push(format!("{marker} {idx:4}: {}", lines[idx - 1]));
    }
    block.join("\n")
}

/// Parse-check `r_code` offline. On failure, optionally writes the
/// `__SYNTAX_ERROR__` payload into `out_path` and returns
/// [`BridgeError::Syntax`]. Skipped with a warning when `Rscript` is not
/// installed on this host.
pub async fn check_r_code_parse(
    r_code: &str,
    expect_result: bool,
    out_path: &Path,
) -> BridgeResult<()> {
    let Ok(rscript) = which::which("Rscript") else {
        warn!("Rscript not found; skipping offline R syntax check");
        return Ok(());
    };

    let code_file = tempfile::Builder::new()
        .prefix("rsb_check_")
        .suffix(".R")
        .tempfile_in(std::env::temp_dir())?;
    tokio::fs::write(code_file.path(), r_code).await?;

    let expr = format!(
        "parse(file = \"{}\")",
        escape_r_string(&code_file.path().to_string_lossy())
    );
    let output = tokio::process::Command::new(rscript)
        .arg("-e")
        .arg(expr)
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let mut diagnostic = String::from_utf8_lossy(&output.stdout).into_owned();
    diagnostic.push_str(&String::from_utf8_lossy(&output.stderr));

    let snippet = extract_parse_error_line(&diagnostic)
        .map(|line_no| format_parse_error_snippet(r_code, line_no, 2))
        .unwrap_or_default();

    if expect_result {
        let mut payload = format!("{SYNTAX_ERROR_MARKER}\n{diagnostic}");
        if !snippet.is_empty() {
            payload.push('\n');
            payload.push_str(&snippet);
            payload.push('\n');
        }
        tokio::fs::write(out_path, payload).await?;
    }

    Err(BridgeError::Syntax {
        message: diagnostic,
        snippet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_number_extracted_from_diagnostic() {
        let out = "Error in parse(file = \"/tmp/x.R\") : /tmp/x.R:3:7: unexpected symbol";
        assert_eq!(extract_parse_error_line(out), Some(3));
        assert_eq!(extract_parse_error_line("no location here"), None);
    }

    #[test]
    fn snippet_window_marks_offending_line() {
        let code = "a\nb\nc d\ne\nf";
        let snippet = format_parse_error_snippet(code, 3, 2);
        assert!(snippet.starts_with("R snippet around parse error:"));
        assert!(snippet.contains(">>    3: c d"));
        assert!(snippet.contains("     1: a"));
        assert!(snippet.contains("     5: f"));
    }

    #[test]
    fn snippet_clamps_to_code_bounds() {
        let code = "only";
        let snippet = format_parse_error_snippet(code, 1, 2);
        assert!(snippet.contains(">>    1: only"));
        assert_eq!(format_parse_error_snippet("", 1, 2), "");
        assert_eq!(format_parse_error_snippet(code, 0, 2), "");
    }
}
