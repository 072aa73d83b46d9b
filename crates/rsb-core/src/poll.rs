// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded wait for the result artifact.
//!
//! RPC acceptance only means the console queued the input, so completion
//! is observed by polling the artifact path until it is non-empty. There
//! is no completion-push channel from the session; the fixed-interval
//! sleep is a known latency/false-timeout tradeoff, kept explicit via
//! the deadline and interval parameters.

use crate::error::BridgeResult;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default artifact poll interval
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn artifact_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Poll `path` until it exists with non-zero size, reading it exactly
/// once on success. Returns `None` when the deadline elapses first.
pub async fn await_artifact(
    path: &Path,
    timeout: Duration,
    interval: Duration,
) -> BridgeResult<Option<Vec<u8>>> {
    let deadline = Instant::now() + timeout;
    loop {
        if artifact_len(path) > 0 {
            let contents = tokio::fs::read(path).await?;
            debug!(bytes = contents.len(), "result artifact ready");
            return Ok(Some(contents));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_contents_once_file_is_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&writer_path, "2\n").unwrap();
        });

        let contents = await_artifact(&path, Duration::from_secs(2), Duration::from_millis(10))
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(contents, Some(b"2\n".to_vec()));
    }

    #[tokio::test]
    async fn empty_artifact_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "").unwrap();

        let contents =
            await_artifact(&path, Duration::from_millis(80), Duration::from_millis(10))
                .await
                .unwrap();
        assert_eq!(contents, None);
    }

    #[tokio::test]
    async fn missing_artifact_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.txt");
        let contents =
            await_artifact(&path, Duration::from_millis(50), Duration::from_millis(10))
                .await
                .unwrap();
        assert_eq!(contents, None);
    }
}
