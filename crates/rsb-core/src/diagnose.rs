// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Causal diagnosis of a result-wait timeout.
//!
//! Purely diagnostic: reads the busy flag, artifact state, recorded
//! session-owner liveness, and abend marker, then derives a small cause
//! taxonomy with one actionable hint per cause. Never mutates state and
//! never retries.

use crate::process::{self, PidState};
use crate::session;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    ComputeStillRunning,
    HandoffOrWriteDelay,
    OutputPathUnavailable,
    SessionLivenessIssue,
    Unknown,
}

impl TimeoutCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutCause::ComputeStillRunning => "compute_still_running",
            TimeoutCause::HandoffOrWriteDelay => "handoff_or_write_delay",
            TimeoutCause::OutputPathUnavailable => "output_path_unavailable",
            TimeoutCause::SessionLivenessIssue => "session_liveness_issue",
            TimeoutCause::Unknown => "unknown",
        }
    }

    pub fn hint(&self) -> Option<(&'static str, &'static str)> {
        match self {
            TimeoutCause::ComputeStillRunning => Some((
                "R code is still running in the live console.",
                "interrupt or wait for the current console task before retrying.",
            )),
            TimeoutCause::HandoffOrWriteDelay => Some((
                "compute finished but result handoff/file write lagged.",
                "increase timeout, reduce payload size, and retry once.",
            )),
            TimeoutCause::OutputPathUnavailable => Some((
                "output file was removed or inaccessible while waiting.",
                "verify /tmp availability and file permissions, then retry.",
            )),
            TimeoutCause::SessionLivenessIssue => Some((
                "session snapshot points to a dead/restarted rsession.",
                "re-resolve live runtime env vars and retry once.",
            )),
            TimeoutCause::Unknown => None,
        }
    }
}

/// Snapshot of everything inspected while diagnosing a poll timeout
#[derive(Debug, Clone)]
pub struct TimeoutDiagnosis {
    pub causes: Vec<TimeoutCause>,
    pub executing: String,
    pub out_exists: bool,
    pub out_size: u64,
    pub session_pid: String,
    pub pid_state: PidState,
    pub abend: String,
}

impl fmt::Display for TimeoutDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let causes = self
            .causes
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");
        writeln!(f, "Timeout diagnostics: causes={causes}")?;
        write!(
            f,
            "Timeout diagnostics: executing={} output_exists={} output_size_bytes={} session_pid={}({}) abend={}",
            self.executing,
            u8::from(self.out_exists),
            self.out_size,
            if self.session_pid.is_empty() {
                "<missing>"
            } else {
                &self.session_pid
            },
            self.pid_state.as_str(),
            self.abend,
        )?;
        for cause in &self.causes {
            if let Some((likely, action)) = cause.hint() {
                write!(f, "\nLikely cause: {likely}\nAction: {action}")?;
            }
        }
        Ok(())
    }
}

/// Diagnose why the artifact never became non-empty.
pub fn diagnose(session_dir: &Path, out_path: &Path, session_pid: &str) -> TimeoutDiagnosis {
    diagnose_with_probe(session_dir, out_path, session_pid, process::is_rsession_alive)
}

pub fn diagnose_with_probe(
    session_dir: &Path,
    out_path: &Path,
    session_pid: &str,
    alive: fn(&str) -> bool,
) -> TimeoutDiagnosis {
    let executing_raw = session::executing_flag_value(session_dir);
    let executing = if executing_raw.is_empty() {
        "<missing>".to_string()
    } else {
        executing_raw.clone()
    };

    let out_exists = out_path.exists();
    let out_size = std::fs::metadata(out_path).map(|m| m.len()).unwrap_or(0);

    let pid_state = process::classify_pid(session_pid, alive);

    let abend_raw = session::extract_kv_value(
        &session_dir.join(session::PERSISTENT_STATE_FILE),
        "abend",
    );
    let abend = if abend_raw.is_empty() {
        "<missing>".to_string()
    } else {
        abend_raw.clone()
    };

    let mut causes = Vec::new();
    if executing_raw == "1" {
        causes.push(TimeoutCause::ComputeStillRunning);
    }
    if out_exists && out_size == 0 && executing_raw != "1" {
        causes.push(TimeoutCause::HandoffOrWriteDelay);
    }
    if !out_exists {
        causes.push(TimeoutCause::OutputPathUnavailable);
    }
    if pid_state.is_liveness_issue() || abend_raw == "1" {
        causes.push(TimeoutCause::SessionLivenessIssue);
    }
    if causes.is_empty() {
        causes.push(TimeoutCause::Unknown);
    }

    TimeoutDiagnosis {
        causes,
        executing,
        out_exists,
        out_size,
        session_pid: session_pid.to_string(),
        pid_state,
        abend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn never(_: &str) -> bool {
        false
    }

    fn always(_: &str) -> bool {
        true
    }

    fn session_with_flag(flag: &str) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("properites")).unwrap();
        fs::write(temp.path().join("properites/executing"), flag).unwrap();
        temp
    }

    #[test]
    fn busy_console_yields_compute_still_running() {
        let session = session_with_flag("1");
        let out = session.path().join("out.txt");
        fs::write(&out, "").unwrap();

        let diagnosis = diagnose_with_probe(session.path(), &out, "123", always);
        assert_eq!(diagnosis.causes, vec![TimeoutCause::ComputeStillRunning]);
        let rendered = diagnosis.to_string();
        assert!(rendered.contains("causes=compute_still_running"));
        assert!(rendered.contains("interrupt or wait"));
    }

    #[test]
    fn idle_console_with_empty_artifact_is_handoff_delay() {
        let session = session_with_flag("0");
        let out = session.path().join("out.txt");
        fs::write(&out, "").unwrap();

        let diagnosis = diagnose_with_probe(session.path(), &out, "123", always);
        assert_eq!(diagnosis.causes, vec![TimeoutCause::HandoffOrWriteDelay]);
    }

    #[test]
    fn missing_artifact_flags_output_path() {
        let session = session_with_flag("0");
        let out = session.path().join("missing.txt");

        let diagnosis = diagnose_with_probe(session.path(), &out, "123", always);
        assert_eq!(diagnosis.causes, vec![TimeoutCause::OutputPathUnavailable]);
    }

    #[test]
    fn dead_pid_or_abend_flags_liveness() {
        let session = session_with_flag("0");
        let out = session.path().join("out.txt");
        fs::write(&out, "").unwrap();

        let diagnosis = diagnose_with_probe(session.path(), &out, "123", never);
        assert!(diagnosis.causes.contains(&TimeoutCause::SessionLivenessIssue));

        fs::write(
            session.path().join(session::PERSISTENT_STATE_FILE),
            "abend=\"1\"\n",
        )
        .unwrap();
        let diagnosis = diagnose_with_probe(session.path(), &out, "123", always);
        assert!(diagnosis.causes.contains(&TimeoutCause::SessionLivenessIssue));
    }

    #[test]
    fn causes_can_co_occur_and_default_to_unknown() {
        let session = session_with_flag("1");
        let out = session.path().join("missing.txt");
        let diagnosis = diagnose_with_probe(session.path(), &out, "", never);
        assert!(diagnosis.causes.contains(&TimeoutCause::ComputeStillRunning));
        assert!(diagnosis.causes.contains(&TimeoutCause::OutputPathUnavailable));

        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        fs::write(&out, "").unwrap();
        // executing flag missing (not "1"), artifact empty => handoff delay
        let diagnosis = diagnose_with_probe(temp.path(), &out, "55", always);
        assert_eq!(diagnosis.causes, vec![TimeoutCause::HandoffOrWriteDelay]);
    }
}
