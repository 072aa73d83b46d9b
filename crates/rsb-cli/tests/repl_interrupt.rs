// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SIGINT delivery across REPL send cycles.
//!
//! The loop keeps one interrupt stream alive for its whole lifetime;
//! a listener created per send would leave every interrupt after the
//! first one unobserved, since registering a handler permanently
//! replaces the default terminate-on-SIGINT disposition.

#![cfg(unix)]

use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

fn raise_sigint() {
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -INT {}", std::process::id()))
        .status()
        .unwrap();
    assert!(status.success());
}

async fn expect_interrupt(sigint: &mut tokio::signal::unix::Signal, label: &str) {
    tokio::select! {
        _ = sigint.recv() => {}
        _ = tokio::time::sleep(Duration::from_secs(5)) => {
            panic!("interrupt not observed: {label}");
        }
    }
}

#[tokio::test]
async fn interrupts_remain_observable_across_send_cycles() {
    let mut sigint = signal(SignalKind::interrupt()).unwrap();

    // First cycle: an in-flight send is cancelled by the interrupt.
    let pending_send = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(pending_send);
    raise_sigint();
    tokio::select! {
        _ = &mut pending_send => panic!("send should lose to the interrupt"),
        _ = expect_interrupt(&mut sigint, "during the first send") => {}
    }

    // Back at the prompt: the same stream must still see the next one.
    raise_sigint();
    expect_interrupt(&mut sigint, "after the first send cycle").await;
}
