// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interactive capability REPL.
//!
//! Inputs are either `<prefix>:<payload>` lines that accumulate into the
//! request state, or bare control words. Validation happens at insertion
//! time, so a bad line is rejected immediately and the loop continues.
//! `send` always clears the capability state, success or not.

use anyhow::Result;
use rsb_core::dispatch::{send_request, SendOutcome};
use rsb_core::error::{BridgeError, BridgeResult};
use rsb_core::policy;
use rsb_core::request::{BenchmarkUnit, CreateSpec, RequestState};
use rsb_core::session::SessionStore;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};

/// What the loop should do after consuming one input line
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Continue,
    Send,
    Quit,
}

pub async fn run() -> Result<()> {
    let mut state = RequestState::new();
    let store = SessionStore::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // One long-lived SIGINT stream for the whole loop. Registering a
    // handler disables the default terminate-on-SIGINT disposition for
    // the rest of the process, so a fresh per-send listener would leave
    // later interrupts unobserved.
    let mut sigint = signal(SignalKind::interrupt())?;

    println!("rstudio-bridge ready. Type 'help' for commands.");
    loop {
        print!("{}", build_prompt(&state));
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = sigint.recv() => {
                eprintln!();
                std::process::exit(130);
            }
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        match apply_input_line(&mut state, &line) {
            Ok(Action::Quit) => return Ok(()),
            Ok(Action::Send) => {
                // Ctrl-C abandons the send, not the REPL; dropping the
                // dispatch future cleans up its temp artifacts.
                let outcome = tokio::select! {
                    result = send_request(&state, &store) => Some(result),
                    _ = sigint.recv() => None,
                };
                state.clear_capabilities();
                match outcome {
                    None => eprintln!("Send cancelled; capability state cleared."),
                    Some(Ok(SendOutcome::Value(text))) => {
                        print!("{text}");
                        if !text.ends_with('\n') {
                            println!();
                        }
                        println!("Send completed; capability state cleared.");
                    }
                    Some(Ok(SendOutcome::AppendOnly)) => {
                        println!("Send completed; capability state cleared.");
                    }
                    Some(Err(err)) => {
                        report_send_error(&err);
                        eprintln!("Send failed; capability state cleared.");
                    }
                }
            }
            Ok(Action::Continue) => {}
            Err(err) => eprintln!("{err}"),
        }
    }
}

pub fn build_prompt(state: &RequestState) -> String {
    format!(
        "rstudio-bridge[pending={},result={},export={}]> ",
        state.pending_capability_count(),
        u8::from(state.result_expr.is_some()),
        u8::from(state.export_expr.is_some()),
    )
}

/// Errors carry their context in separate fields so the one-line Display
/// stays terse; the REPL is where the full detail gets rendered.
fn report_send_error(err: &BridgeError) {
    eprintln!("{err}");
    match err {
        BridgeError::TransportTimeout { detail, .. }
        | BridgeError::TransportFailure { detail, .. } => eprintln!("{detail}"),
        BridgeError::ResultTimeout { diagnosis, .. } => eprintln!("{diagnosis}"),
        BridgeError::Syntax { snippet, .. } if !snippet.is_empty() => eprintln!("{snippet}"),
        _ => {}
    }
}

/// Consume one REPL line: a control word, or `<prefix>:<payload>`.
pub fn apply_input_line(state: &mut RequestState, line: &str) -> BridgeResult<Action> {
    let normalized = line.trim();
    if normalized.is_empty() {
        return Ok(Action::Continue);
    }

    match normalized {
        "help" | "?" => {
            print_help();
            return Ok(Action::Continue);
        }
        "show" => {
            show_state(state);
            return Ok(Action::Continue);
        }
        "clear" => {
            state.clear_capabilities();
            println!("Cleared accumulated capabilities.");
            return Ok(Action::Continue);
        }
        "send" => return Ok(Action::Send),
        "quit" | "exit" => return Ok(Action::Quit),
        _ => {}
    }

    let Some((prefix, payload)) = line.split_once(':') else {
        return Err(BridgeError::malformed(
            "Input must be '<prefix>:<payload>' or a control command.",
        ));
    };

    match prefix.trim().to_lowercase().as_str() {
        "append" | "append-code" => {
            policy::validate_append_fragment(payload)?;
            state.append_fragments.push(payload.to_string());
        }
        "result" | "set-result-expr" => {
            policy::validate_result_expr(payload)?;
            state.result_expr = Some(payload.to_string());
        }
        "export" | "r-state-export" => {
            policy::validate_export_expr(payload)?;
            state.export_expr = Some(payload.to_string());
        }
        "create" | "create-global-variable" => {
            let (name, expr) = policy::parse_create_spec(payload, "create")?;
            state.create_specs.push(CreateSpec { name, expr });
        }
        "modify" | "modify-global-env" => {
            policy::validate_modify_fragment(payload)?;
            state.modify_fragments.push(payload.to_string());
        }
        "session-dir" => state.session_dir = Some(PathBuf::from(payload.trim())),
        "id" => state.request_id = parse_int(payload, "id")?,
        "rpostback-bin" | "postback-bin" => {
            state.postback_bin = Some(PathBuf::from(payload.trim()));
        }
        "out" => state.out_path = Some(PathBuf::from(payload.trim())),
        "timeout" => state.wait_timeout_secs = parse_int(payload, "timeout")?,
        "rpc-timeout" => state.rpc_timeout_secs = parse_int(payload, "rpc-timeout")?,
        "benchmark" => state.benchmark = parse_bool(payload)?,
        "benchmark-unit" => state.benchmark_unit = BenchmarkUnit::parse(payload)?,
        "print-code" => state.print_code = parse_bool(payload)?,
        "capture-output" => state.capture_output = parse_bool(payload)?,
        _ => {
            return Err(BridgeError::malformed(format!(
                "Unknown input prefix: {}",
                prefix.trim()
            )));
        }
    }

    Ok(Action::Continue)
}

fn parse_int(value: &str, label: &str) -> BridgeResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::malformed(format!("{label} must be a non-negative integer.")))
}

pub fn parse_bool(value: &str) -> BridgeResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(BridgeError::malformed(format!(
            "Expected boolean (on/off), got: {other}"
        ))),
    }
}

fn print_help() {
    println!(
        "Commands:\n\
         \x20 append:<R statement>          Append statement in scratch env\n\
         \x20 result:<R expression>         Set result expression (single line)\n\
         \x20 export:<R expression>         Export expression via saveRDS and return file path\n\
         \x20 create:<name>:=<expr>         Create new variable in .GlobalEnv\n\
         \x20 modify:<R statement>          Evaluate statement in .GlobalEnv\n\
         \x20 session-dir:<dir>             Override active RStudio session directory\n\
         \x20 id:<int>                      JSON-RPC request id\n\
         \x20 rpostback-bin:<path>          Override rpostback binary\n\
         \x20 out:<path>                    Result output file\n\
         \x20 timeout:<seconds>             Wait timeout for result file\n\
         \x20 rpc-timeout:<seconds>         Hard timeout for RPC send step\n\
         \x20 benchmark:<on|off>            Benchmark result expression\n\
         \x20 benchmark-unit:<seconds|ms>   Unit for benchmark\n\
         \x20 print-code:<on|off>           Print generated R snippet to stderr\n\
         \x20 capture-output:<on|off>       Return structured stdout/stderr with result\n\
         \n\
         Control:\n\
         \x20 show                           Show current accumulated state\n\
         \x20 clear                          Clear accumulated capabilities\n\
         \x20 send                           Validate/build/send accumulated request\n\
         \x20 help                           Show this help\n\
         \x20 quit                           Exit"
    );
}

fn show_state(state: &RequestState) {
    let display_path = |p: &Option<PathBuf>, fallback: &str| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| fallback.to_string())
    };
    println!("State summary:");
    println!("  pending capabilities: {}", state.pending_capability_count());
    println!("  append snippets: {}", state.append_fragments.len());
    println!("  result set: {}", state.result_expr.is_some());
    println!("  export set: {}", state.export_expr.is_some());
    println!("  create specs: {}", state.create_specs.len());
    println!("  modify snippets: {}", state.modify_fragments.len());
    println!("  session-dir: {}", display_path(&state.session_dir, "<auto>"));
    println!("  id: {}", state.request_id);
    println!(
        "  rpostback-bin: {}",
        display_path(&state.postback_bin, "<default>")
    );
    println!("  out: {}", display_path(&state.out_path, "<tmp-if-needed>"));
    println!("  timeout: {}", state.wait_timeout_secs);
    println!("  rpc-timeout: {}", state.rpc_timeout_secs);
    println!("  benchmark: {}", if state.benchmark { "on" } else { "off" });
    println!("  benchmark-unit: {}", state.benchmark_unit.as_str());
    println!("  print-code: {}", if state.print_code { "on" } else { "off" });
    println!(
        "  capture-output: {}",
        if state.capture_output { "on" } else { "off" }
    );
}
