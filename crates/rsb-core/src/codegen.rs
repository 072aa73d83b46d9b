// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! R code synthesis.
//!
//! Compiles a validated [`RequestState`] into one self-contained,
//! instrumented R fragment. The fragment snapshots the global environment
//! before and after execution, runs appended code inside a scratch child
//! environment, serializes exactly one terminal outcome to the result
//! artifact, and raises on any undeclared global binding change.
//!
//! The fragment is assembled as a list of typed statements rendered
//! through a single escaping function, so every interpolated string value
//! passes through exactly one escape path before entering generated
//! source.

use crate::error::{BridgeError, BridgeResult};
use crate::request::{BenchmarkUnit, RequestState, SendContext};

/// Escape a Rust string for embedding inside a double-quoted R string
/// literal. Order matters: backslash first, then quote, then newline, so
/// that a payload cannot terminate the literal early.
pub fn escape_r_string(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// One statement of the synthesized fragment
enum RStmt {
    /// Validated R code interpolated verbatim
    Raw(String),
    /// `<var> <- "<escaped string literal>"`
    StringAssign { var: &'static str, value: String },
    /// Create guard: refuse an existing global, then bind the expression
    GuardedCreate { name: String, expr: String },
    /// Evaluate a fragment against the global environment
    GlobalEval(String),
}

impl RStmt {
    fn render(&self) -> String {
        match self {
            RStmt::Raw(code) => code.clone(),
            RStmt::StringAssign { var, value } => {
                format!("{var} <- \"{}\"", escape_r_string(value))
            }
            RStmt::GuardedCreate { name, expr } => {
                let guard = format!(
                    "if (exists(\"{name}\", envir = .GlobalEnv, inherits = FALSE)) stop(\"create refused: '{name}' already exists in .GlobalEnv\")"
                );
                let bind = format!("{name} <- ({expr})");
                let publish = format!("assign(\"{name}\", {name}, envir = .GlobalEnv)");
                format!("{guard}\n{bind}\n{publish}")
            }
            RStmt::GlobalEval(code) => {
                format!(
                    "eval(parse(text = \"{}\"), envir = .GlobalEnv)",
                    escape_r_string(code)
                )
            }
        }
    }
}

fn join_stmts(stmts: &[RStmt]) -> String {
    if stmts.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for stmt in stmts {
        out.push_str(&stmt.render());
        out.push('\n');
    }
    out
}

fn indent_block(text: &str, indent: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for line in text.trim_end_matches('\n').split('\n') {
        out.push_str(indent);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Serialize the trapped outcome under one of the artifact formats.
/// `condition` guards the block; `error_expr` is the R expression whose
/// message is reported, or None for a plain value write.
fn push_outcome_block(code: &mut String, condition: &str, capture: bool, payload: Payload<'_>) {
    code.push_str(&format!("if ({condition}) {{\n"));
    match payload {
        Payload::Error(expr) => {
            if capture {
                code.push_str(&format!(
                    "  dput(list(error = {expr}, stdout = .rsb_captured_stdout, stderr = .rsb_captured_stderr), file = .rsb_result_out_path)\n"
                ));
            } else {
                code.push_str(&format!(
                    "  writeLines(paste0(\"__ERROR__:\", {expr}), .rsb_result_out_path)\n"
                ));
            }
        }
        Payload::ErrorLiteral(message) => {
            if capture {
                code.push_str(&format!(
                    "  dput(list(error = \"{message}\", stdout = .rsb_captured_stdout, stderr = .rsb_captured_stderr), file = .rsb_result_out_path)\n"
                ));
            } else {
                code.push_str(&format!(
                    "  writeLines(\"__ERROR__: {message}\", .rsb_result_out_path)\n"
                ));
            }
        }
        Payload::Value => {
            if capture {
                code.push_str(
                    "  dput(list(result = .rsb_exec_result, stdout = .rsb_captured_stdout, stderr = .rsb_captured_stderr), file = .rsb_result_out_path)\n"
                );
            } else {
                code.push_str("  dput(.rsb_exec_result, file = .rsb_result_out_path)\n");
            }
        }
    }
    code.push_str("  .rsb_result_written <- TRUE\n");
    code.push_str("}\n");
}

enum Payload<'a> {
    /// R expression producing the error message
    Error(&'a str),
    /// Fixed message, already escape-free
    ErrorLiteral(&'a str),
    /// The real execution result
    Value,
}

/// Synthesize the instrumented R fragment for one dispatch.
///
/// Deterministic given identical inputs, aside from the temp artifact
/// paths already fixed in the send context.
pub fn build_r_code(state: &RequestState, ctx: &SendContext) -> BridgeResult<String> {
    let mut exec_stmts: Vec<RStmt> = Vec::new();
    let mut core_stmts: Vec<RStmt> = Vec::new();
    let mut allowed_names: Vec<String> = Vec::new();

    for fragment in &state.append_fragments {
        exec_stmts.push(RStmt::Raw(fragment.clone()));
    }

    if let Some(expr) = &state.result_expr {
        if state.benchmark {
            exec_stmts.push(RStmt::Raw(
                ".rsb_bench_t0 <- proc.time()[[\"elapsed\"]]".to_string(),
            ));
            exec_stmts.push(RStmt::Raw(format!(
                ".rsb_result_expr <- tryCatch({{ invisible(({expr})); proc.time()[[\"elapsed\"]] - .rsb_bench_t0 }}, error = function(e) e)"
            )));
            if state.benchmark_unit == BenchmarkUnit::Millis {
                exec_stmts.push(RStmt::Raw(
                    "if (!inherits(.rsb_result_expr, \"error\")) .rsb_result_expr <- .rsb_result_expr * 1000"
                        .to_string(),
                ));
            }
        } else {
            exec_stmts.push(RStmt::Raw(format!(
                ".rsb_result_expr <- tryCatch(({expr}), error = function(e) e)"
            )));
        }
    }

    if let Some(expr) = &state.export_expr {
        let export_path = ctx.export_path().ok_or_else(|| {
            BridgeError::malformed("export requested without an export artifact path.")
        })?;
        exec_stmts.push(RStmt::StringAssign {
            var: ".rsb_state_export_path",
            value: export_path.to_string_lossy().into_owned(),
        });
        exec_stmts.push(RStmt::Raw(format!(".rsb_state_payload <- ({expr})")));
        exec_stmts.push(RStmt::Raw(
            "saveRDS(.rsb_state_payload, file = .rsb_state_export_path, compress = \"xz\")"
                .to_string(),
        ));
        exec_stmts.push(RStmt::Raw("rm(.rsb_state_payload)".to_string()));
        exec_stmts.push(RStmt::Raw(
            "if (!file.exists(.rsb_state_export_path)) stop(\"State export file was not created\")"
                .to_string(),
        ));
        exec_stmts.push(RStmt::Raw(
            ".rsb_result_expr <- .rsb_state_export_path".to_string(),
        ));
    }

    for spec in &state.create_specs {
        allowed_names.push(spec.name.clone());
        core_stmts.push(RStmt::GuardedCreate {
            name: spec.name.clone(),
            expr: spec.expr.clone(),
        });
    }

    for fragment in &state.modify_fragments {
        core_stmts.push(RStmt::GlobalEval(fragment.clone()));
    }

    let allowed_added = allowed_names
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(",");

    let exec_block = join_stmts(&exec_stmts);
    let core_block = join_stmts(&core_stmts);

    let out_path = if ctx.expect_result {
        ctx.out_path.to_string_lossy().into_owned()
    } else {
        String::new()
    };

    let mut code = String::new();
    code.push_str(".rsb_before <- ls(envir = .GlobalEnv, all.names = TRUE)\n");
    code.push_str(&format!(".rsb_allowed_added <- c({allowed_added})\n"));
    code.push_str(
        &RStmt::StringAssign {
            var: ".rsb_result_out_path",
            value: out_path,
        }
        .render(),
    );
    code.push('\n');
    code.push_str(&format!(
        ".rsb_capture_output <- {}\n",
        if state.capture_output { "TRUE" } else { "FALSE" }
    ));
    code.push_str(".rsb_captured_stdout <- character(0)\n");
    code.push_str(".rsb_captured_stderr <- character(0)\n");
    code.push_str(".rsb_result_written <- FALSE\n");
    code.push_str(".rsb_exec_result <- NULL\n");
    code.push_str(".rsb_run_core <- function() {\n");
    code.push_str("  .rsb_exec_result <<- with(new.env(parent = .GlobalEnv), {\n");
    code.push_str(&indent_block(&exec_block, "    "));
    code.push_str("  })\n");
    code.push_str(&indent_block(&core_block, "  "));
    code.push_str("}\n");
    code.push_str(".rsb_msg <- function(x) {\n");
    code.push_str("  if (inherits(x, \"condition\")) conditionMessage(x) else as.character(x)\n");
    code.push_str("}\n");
    code.push_str(".rsb_exec_error <- tryCatch({\n");
    code.push_str("  if (.rsb_capture_output) {\n");
    code.push_str("    .rsb_captured_stdout <- capture.output({\n");
    code.push_str("      withCallingHandlers({\n");
    code.push_str("        .rsb_run_core()\n");
    code.push_str("      }, message = function(m) {\n");
    code.push_str("        .rsb_captured_stderr <<- c(.rsb_captured_stderr, conditionMessage(m))\n");
    code.push_str("        invokeRestart(\"muffleMessage\")\n");
    code.push_str("      }, warning = function(w) {\n");
    code.push_str("        .rsb_captured_stderr <<- c(.rsb_captured_stderr, paste0(\"WARNING: \", conditionMessage(w)))\n");
    code.push_str("        invokeRestart(\"muffleWarning\")\n");
    code.push_str("      })\n");
    code.push_str("    }, type = \"output\")\n");
    code.push_str("  } else {\n");
    code.push_str("    .rsb_run_core()\n");
    code.push_str("  }\n");
    // Success must yield NULL here, not the core's last value, or the
    // error branch below would misfire.
    code.push_str("  NULL\n");
    code.push_str("}, error = function(e) e)\n");

    if ctx.expect_result {
        let capture = state.capture_output;
        // A trapped top-level error short-circuits before any other outcome.
        push_outcome_block(
            &mut code,
            "!is.null(.rsb_exec_error)",
            capture,
            Payload::Error(".rsb_msg(.rsb_exec_error)"),
        );
        push_outcome_block(
            &mut code,
            "is.null(.rsb_exec_error) && is.null(.rsb_exec_result)",
            capture,
            Payload::ErrorLiteral("no result produced"),
        );
        push_outcome_block(
            &mut code,
            "is.null(.rsb_exec_error) && inherits(.rsb_exec_result, \"error\")",
            capture,
            Payload::Error(".rsb_msg(.rsb_exec_result)"),
        );
        push_outcome_block(
            &mut code,
            "is.null(.rsb_exec_error) && !inherits(.rsb_exec_result, \"error\") && !is.null(.rsb_exec_result)",
            capture,
            Payload::Value,
        );
    }

    // Re-raise a trapped top-level error after serialization, so the
    // session's own error channel reports the failure too.
    code.push_str("if (!is.null(.rsb_exec_error)) {\n");
    code.push_str("  stop(.rsb_msg(.rsb_exec_error))\n");
    code.push_str("}\n");

    // Leak detection. The two snapshots are taken moments apart with no
    // concurrency guard; concurrent activity in the same session (e.g. an
    // autosave) can produce a false positive. Known limitation.
    code.push_str(".rsb_after <- ls(envir = .GlobalEnv, all.names = TRUE)\n");
    code.push_str(".rsb_new <- setdiff(.rsb_after, .rsb_before)\n");
    code.push_str(".rsb_removed <- setdiff(.rsb_before, .rsb_after)\n");
    code.push_str(".rsb_unexpected_new <- setdiff(.rsb_new, .rsb_allowed_added)\n");
    code.push_str(".rsb_unexpected_removed <- setdiff(.rsb_removed, character(0))\n");
    code.push_str(
        "if (length(.rsb_unexpected_new) > 0 || length(.rsb_unexpected_removed) > 0) {\n",
    );
    code.push_str("  stop(\"Global environment leak detected\")\n");
    code.push_str("}\n");

    Ok(code)
}

/// Wrap a fragment so it evaluates inside a disposable child scope of the
/// global environment: read access to globals, no implicit write-back.
pub fn isolate_fragment(code: &str) -> String {
    format!("local({{\n{code}\n}}, envir = new.env(parent = .GlobalEnv))")
}
