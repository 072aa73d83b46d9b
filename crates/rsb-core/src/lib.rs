// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core library for the RStudio console bridge.
//!
//! Injects R code into a live RStudio Server console through the
//! `rpostback` JSON-RPC transport, with static policy validation,
//! instrumented code synthesis, on-disk session discovery, bounded
//! result polling, and causal timeout diagnosis.

pub mod codegen;
pub mod diagnose;
pub mod dispatch;
pub mod error;
pub mod policy;
pub mod poll;
pub mod process;
pub mod request;
pub mod rpc;
pub mod session;
pub mod syntax;

pub use dispatch::{send_request, SendOutcome};
pub use error::{BridgeError, BridgeResult};
pub use request::{BenchmarkUnit, CreateSpec, RequestState, SendContext};
pub use session::{SessionDescriptor, SessionStore};
