// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One dispatch, end to end: validate, synthesize, resolve, precheck,
//! send, poll, diagnose.
//!
//! All validation happens strictly before any external call. Once the
//! transport call is made, failures are reported, never swallowed; the
//! caller clears the capability state afterwards regardless of outcome.

use crate::codegen;
use crate::diagnose;
use crate::error::{BridgeError, BridgeResult};
use crate::poll;
use crate::request::RequestState;
use crate::rpc::{self, Dispatcher, TransportOutcome};
use crate::session::{self, SessionDescriptor, SessionStore};
use crate::syntax;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Successful outcome of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The result artifact's contents: a raw serialized value, or the
    /// export artifact path, or a structured capture record.
    Value(String),
    /// Append-only send: the console accepted the input and no artifact
    /// will ever be produced.
    AppendOnly,
}

/// Interpret the result artifact per the artifact contract.
pub fn parse_artifact(contents: &[u8]) -> BridgeResult<String> {
    let text = String::from_utf8_lossy(contents).into_owned();
    if let Some(rest) = text.strip_prefix(syntax::SYNTAX_ERROR_MARKER) {
        return Err(BridgeError::Syntax {
            message: rest.trim_start_matches('\n').to_string(),
            snippet: String::new(),
        });
    }
    if let Some(rest) = text.strip_prefix("__ERROR__:") {
        return Err(BridgeError::Remote(rest.trim().to_string()));
    }
    Ok(text)
}

/// Validate, synthesize and dispatch the accumulated request state.
///
/// Temp artifacts live inside the derived send context, so they are
/// deleted on every exit path, including cancellation of this future.
pub async fn send_request(
    state: &RequestState,
    store: &SessionStore,
) -> BridgeResult<SendOutcome> {
    let mut ctx = state.validate_for_send()?;

    let session_dir = store.resolve(state.session_dir.as_deref())?;
    store.load_session_environment(&session_dir);

    let r_code = codegen::build_r_code(state, &ctx)?;

    if ctx.append_only {
        warn!(
            "append-only send has no structured return value; add result/export/create/modify if you need output"
        );
    }

    syntax::check_r_code_parse(&r_code, ctx.expect_result, &ctx.out_path).await?;

    if state.print_code {
        eprintln!("Generated R code:\n{r_code}");
    }

    let descriptor = SessionDescriptor::read(&session_dir)?;

    if ctx.expect_result {
        // Truncate up front so the poller only ever sees this request's
        // outcome.
        tokio::fs::write(&ctx.out_path, b"").await?;
    }

    if session::is_session_busy(&session_dir) {
        return Err(BridgeError::SessionBusy(format!(
            "finish or interrupt the current console task, then retry ({})",
            session_dir.display()
        )));
    }

    let payload = rpc::console_input_payload(
        &descriptor.client_id,
        &codegen::isolate_fragment(&r_code),
        state.request_id,
    );

    let dispatcher = Dispatcher::new(state.postback_bin.clone());
    info!(
        session_dir = %session_dir.display(),
        client_id = %descriptor.client_id,
        "dispatching console_input"
    );
    match dispatcher.dispatch(&payload, state.rpc_timeout_secs).await? {
        TransportOutcome::Accepted { .. } => {}
        TransportOutcome::TimedOut => {
            return Err(BridgeError::TransportTimeout {
                seconds: state.rpc_timeout_secs,
                detail: transport_timeout_detail(&descriptor, store),
            });
        }
        TransportOutcome::ProtocolError { raw } => {
            return Err(BridgeError::TransportFailure {
                code: 1,
                detail: format!("JSON-RPC error returned for console_input: {}", raw.trim()),
            });
        }
        TransportOutcome::Indeterminate { code, raw } => {
            let mut detail = format!("rpostback did not return a JSON-RPC result: {}", raw.trim());
            detail.push_str(
                "\nHint: stale snapshot env vars can break auth; avoid overriding live RStudio env vars when they are already present.",
            );
            return Err(BridgeError::TransportFailure { code, detail });
        }
    }

    if !ctx.expect_result {
        debug!("append-only dispatch accepted");
        return Ok(SendOutcome::AppendOnly);
    }

    let contents = poll::await_artifact(
        &ctx.out_path,
        Duration::from_secs(state.wait_timeout_secs),
        poll::POLL_INTERVAL,
    )
    .await?;

    let Some(contents) = contents else {
        // The caller's own env hint takes precedence over the snapshot
        // pid, matching how the session was resolved.
        let env_pid = std::env::var(session::ENV_SESSION_PID)
            .ok()
            .filter(|pid| !pid.is_empty())
            .unwrap_or_else(|| descriptor.env_session_pid.clone());
        return Err(BridgeError::ResultTimeout {
            path: ctx.out_path.display().to_string(),
            diagnosis: diagnose::diagnose(&session_dir, &ctx.out_path, &env_pid),
        });
    };

    let value = parse_artifact(&contents)?;
    ctx.keep_export()?;
    Ok(SendOutcome::Value(value))
}

/// Session metadata attached to a transport timeout, with the stale
/// snapshot hint when abend or a dead owner is also observed.
fn transport_timeout_detail(descriptor: &SessionDescriptor, store: &SessionStore) -> String {
    let pid = &descriptor.env_session_pid;
    let pid_display = if pid.is_empty() { "<missing>" } else { pid };
    let pid_state = if store.pid_alive(pid) { "alive" } else { "dead" };
    let abend = if descriptor.abend.is_empty() {
        "<missing>"
    } else {
        &descriptor.abend
    };
    let mut detail = format!(
        "Session metadata: dir={} abend={} active-client-id={} env-session-pid={} ({})",
        descriptor.dir.display(),
        abend,
        descriptor.client_id,
        pid_display,
        pid_state,
    );
    if descriptor.abend == "1" || pid_state == "dead" {
        detail.push_str(
            "\nHint: session snapshot metadata may be stale. Prefer live runtime env vars (RSTUDIO_SESSION_STREAM/RS_PORT_TOKEN) over suspended-session-data values.",
        );
    }
    detail
}
