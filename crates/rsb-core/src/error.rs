// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::diagnose::TimeoutDiagnosis;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while building or dispatching a console request
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A fragment violates the static safety policy. Raised before any
    /// transport activity and never retried.
    #[error("{0}")]
    Policy(String),

    /// Structural violation: bad identifier, missing spec parts, an
    /// incompatible capability combination, or a non-integer option.
    #[error("{0}")]
    MalformedRequest(String),

    /// The synthesized R code failed the offline parse check.
    #[error("R syntax check failed: {message}")]
    Syntax { message: String, snippet: String },

    #[error("Unable to locate an active RStudio session: {0}")]
    SessionNotFound(String),

    #[error("RStudio session appears busy (executing=1): {0}")]
    SessionBusy(String),

    /// The rpostback call itself exceeded its hard timeout.
    #[error("RPC send timed out after {seconds}s")]
    TransportTimeout { seconds: u64, detail: String },

    /// The rpostback call failed at the transport or protocol level.
    #[error("Failed to send RPC request (rc={code}): {detail}")]
    TransportFailure { code: i32, detail: String },

    /// The result artifact never became non-empty within the wait deadline.
    #[error("Timed out waiting for result file: {path}")]
    ResultTimeout {
        path: String,
        diagnosis: TimeoutDiagnosis,
    },

    /// The remote fragment trapped an error or produced no result,
    /// reported through the artifact contents.
    #[error("Remote execution failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn policy(msg: impl Into<String>) -> Self {
        BridgeError::Policy(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        BridgeError::MalformedRequest(msg.into())
    }
}
