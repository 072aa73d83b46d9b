// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Liveness probe for the session-owning rsession process.
//!
//! A recorded pid is only trusted when a process with that id exists *and*
//! its command line names the expected server binary. A live-but-different
//! process reusing the pid must not be treated as a match. The command
//! line marker is the single swap point for other target platforms.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Substring expected in the owning process's command line
pub const RSESSION_CMDLINE_MARKER: &str = "/usr/lib/rstudio-server/bin/rsession";

/// Directory of per-stream pid files maintained by the server
const RSESSION_PID_DIR: &str = "/var/run/rstudio-server/rstudio-rsession";

fn is_numeric_pid(pid: &str) -> bool {
    !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit())
}

/// True when `pid` refers to a running rsession instance.
pub fn is_rsession_alive(pid: &str) -> bool {
    if !is_numeric_pid(pid) {
        return false;
    }
    if !Path::new("/proc").join(pid).exists() {
        return false;
    }
    let output = match Command::new("ps").args(["-p", pid, "-o", "args="]).output() {
        Ok(output) => output,
        Err(_) => return false,
    };
    if !output.status.success() {
        return false;
    }
    String::from_utf8_lossy(&output.stdout).contains(RSESSION_CMDLINE_MARKER)
}

/// Plausibility classification of a recorded session-owner pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    Missing,
    Alive,
    DeadOrNotRsession,
    Invalid,
}

impl PidState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PidState::Missing => "<missing>",
            PidState::Alive => "alive",
            PidState::DeadOrNotRsession => "dead_or_not_rsession",
            PidState::Invalid => "invalid",
        }
    }

    pub fn is_liveness_issue(&self) -> bool {
        matches!(self, PidState::DeadOrNotRsession | PidState::Invalid)
    }
}

/// Classify a recorded pid using a caller-supplied liveness probe, so
/// tests can substitute the process-table check.
pub fn classify_pid(pid: &str, alive: fn(&str) -> bool) -> PidState {
    if pid.is_empty() {
        PidState::Missing
    } else if alive(pid) {
        PidState::Alive
    } else if is_numeric_pid(pid) {
        PidState::DeadOrNotRsession
    } else {
        PidState::Invalid
    }
}

/// Recover the session stream identifier for a live pid from the
/// server's pid files. Returns the file stem of the matching entry.
pub fn infer_stream_from_pid(pid: &str) -> Option<String> {
    infer_stream_from_pid_in(pid, Path::new(RSESSION_PID_DIR))
}

pub(crate) fn infer_stream_from_pid_in(pid: &str, pid_dir: &Path) -> Option<String> {
    if !is_numeric_pid(pid) {
        return None;
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(pid_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "pid"))
        .collect();
    entries.sort();
    for pid_file in entries {
        let Ok(contents) = std::fs::read_to_string(&pid_file) else {
            continue;
        };
        if contents.trim() == pid {
            return pid_file.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_numeric_pid_is_never_alive() {
        assert!(!is_rsession_alive(""));
        assert!(!is_rsession_alive("12a"));
        assert!(!is_rsession_alive("-1"));
    }

    #[test]
    fn classify_distinguishes_dead_from_invalid() {
        fn never(_: &str) -> bool {
            false
        }
        fn always(_: &str) -> bool {
            true
        }
        assert_eq!(classify_pid("", never), PidState::Missing);
        assert_eq!(classify_pid("123", always), PidState::Alive);
        assert_eq!(classify_pid("123", never), PidState::DeadOrNotRsession);
        assert_eq!(classify_pid("abc", never), PidState::Invalid);
        assert!(PidState::DeadOrNotRsession.is_liveness_issue());
        assert!(!PidState::Alive.is_liveness_issue());
    }

    #[test]
    fn stream_inferred_from_matching_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stream-a.pid"), "100\n").unwrap();
        std::fs::write(dir.path().join("stream-b.pid"), "200\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "200").unwrap();

        assert_eq!(
            infer_stream_from_pid_in("200", dir.path()),
            Some("stream-b".to_string())
        );
        assert_eq!(infer_stream_from_pid_in("300", dir.path()), None);
        assert_eq!(infer_stream_from_pid_in("x", dir.path()), None);
    }
}
