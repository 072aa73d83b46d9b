// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Accumulated request state and the per-dispatch send context.

use crate::error::{BridgeError, BridgeResult};
use crate::policy;
use std::collections::HashSet;
use std::path::PathBuf;
use tempfile::{Builder, TempPath};

/// Unit used when benchmarking the result expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BenchmarkUnit {
    #[default]
    Seconds,
    Millis,
}

impl BenchmarkUnit {
    pub fn parse(value: &str) -> BridgeResult<Self> {
        match value.trim() {
            "seconds" => Ok(BenchmarkUnit::Seconds),
            "ms" => Ok(BenchmarkUnit::Millis),
            _ => Err(BridgeError::malformed(
                "benchmark-unit must be either 'seconds' or 'ms'.",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkUnit::Seconds => "seconds",
            BenchmarkUnit::Millis => "ms",
        }
    }
}

/// A validated `<name>:=<expr>` create capability
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub expr: String,
}

/// Accumulator for pending capabilities plus transport options.
///
/// Owned by the calling loop, mutated by successive validated insertions,
/// consumed wholesale by one dispatch attempt, then always cleared.
/// Capabilities never persist across a dispatch.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    pub append_fragments: Vec<String>,
    pub result_expr: Option<String>,
    pub export_expr: Option<String>,
    pub create_specs: Vec<CreateSpec>,
    pub modify_fragments: Vec<String>,

    pub session_dir: Option<PathBuf>,
    pub request_id: u64,
    pub postback_bin: Option<PathBuf>,
    pub out_path: Option<PathBuf>,
    pub wait_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub benchmark: bool,
    pub benchmark_unit: BenchmarkUnit,
    pub print_code: bool,
    pub capture_output: bool,
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            request_id: 1,
            wait_timeout_secs: 8,
            rpc_timeout_secs: 12,
            ..Default::default()
        }
    }

    /// Drop all pending capabilities. Transport options survive; the
    /// benchmark flag does not, since it binds to the cleared result.
    pub fn clear_capabilities(&mut self) {
        self.append_fragments.clear();
        self.result_expr = None;
        self.export_expr = None;
        self.create_specs.clear();
        self.modify_fragments.clear();
        self.benchmark = false;
    }

    pub fn pending_capability_count(&self) -> usize {
        self.append_fragments.len()
            + usize::from(self.result_expr.is_some())
            + usize::from(self.export_expr.is_some())
            + self.create_specs.len()
            + self.modify_fragments.len()
    }

    /// Validate the accumulated state for one dispatch and derive the
    /// send context, allocating temp artifact paths where needed.
    pub fn validate_for_send(&self) -> BridgeResult<SendContext> {
        let has_append = !self.append_fragments.is_empty();
        let has_result = self.result_expr.is_some();
        let has_export = self.export_expr.is_some();
        let has_create = !self.create_specs.is_empty();
        let has_modify = !self.modify_fragments.is_empty();
        let has_terminal = has_result || has_export || has_create || has_modify;

        if !(has_append || has_terminal) {
            return Err(BridgeError::malformed("At least one capability is required."));
        }

        if has_export && (has_result || has_create || has_modify) {
            return Err(BridgeError::malformed(
                "export cannot be combined with result, create, or modify.",
            ));
        }

        if self.benchmark {
            if !has_result {
                return Err(BridgeError::malformed("benchmark requires result."));
            }
            if has_export || has_create || has_modify {
                return Err(BridgeError::malformed(
                    "benchmark cannot be combined with export, create, or modify.",
                ));
            }
        }

        for fragment in &self.append_fragments {
            policy::validate_append_fragment(fragment)?;
        }
        if let Some(expr) = &self.result_expr {
            policy::validate_result_expr(expr)?;
        }
        if let Some(expr) = &self.export_expr {
            policy::validate_export_expr(expr)?;
        }
        let mut seen = HashSet::new();
        for spec in &self.create_specs {
            policy::validate_identifier(&spec.name, "create name")?;
            if !seen.insert(spec.name.as_str()) {
                return Err(BridgeError::malformed(format!(
                    "create duplicates name '{}' in one invocation.",
                    spec.name
                )));
            }
        }
        for fragment in &self.modify_fragments {
            policy::validate_modify_fragment(fragment)?;
        }

        let expect_result = has_result || has_export;
        let append_only = has_append && !has_terminal;

        if self.capture_output && !expect_result {
            return Err(BridgeError::malformed(
                "capture-output requires result or export.",
            ));
        }

        let mut temp_out = None;
        let out_path = match (&self.out_path, expect_result) {
            (Some(path), _) => path.clone(),
            (None, true) => {
                let temp = Builder::new()
                    .prefix("rsb_capability_result_")
                    .suffix(".txt")
                    .tempfile_in(std::env::temp_dir())?
                    .into_temp_path();
                let path = temp.to_path_buf();
                temp_out = Some(temp);
                path
            }
            (None, false) => PathBuf::new(),
        };

        let export_path = if has_export {
            let temp = Builder::new()
                .prefix("rsb_state_")
                .suffix(".rds")
                .tempfile_in(std::env::temp_dir())?
                .into_temp_path();
            Some(temp)
        } else {
            None
        };

        Ok(SendContext {
            expect_result,
            out_path,
            temp_out,
            export_path,
            append_only,
        })
    }
}

/// Per-dispatch derived context. Temp artifacts are owned `TempPath`s,
/// so dropping the context (including on cancellation) deletes them.
#[derive(Debug)]
pub struct SendContext {
    pub expect_result: bool,
    pub out_path: PathBuf,
    temp_out: Option<TempPath>,
    export_path: Option<TempPath>,
    pub append_only: bool,
}

impl SendContext {
    pub fn is_temp_out_path(&self) -> bool {
        self.temp_out.is_some()
    }

    pub fn export_path(&self) -> Option<PathBuf> {
        self.export_path.as_ref().map(|p| p.to_path_buf())
    }

    /// Persist the export artifact after a successful send; its path is
    /// the value handed back to the caller.
    pub fn keep_export(&mut self) -> BridgeResult<Option<PathBuf>> {
        match self.export_path.take() {
            Some(temp) => {
                let path = temp
                    .keep()
                    .map_err(|e| BridgeError::Other(anyhow::anyhow!("{e}")))?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }
}
