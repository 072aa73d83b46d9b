// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session discovery over on-disk snapshot files.
//!
//! RStudio Server records per-session state under
//! `~/.local/share/rstudio/sessions/active/session-*`. The snapshot files
//! can be stale relative to the live process, so resolution prefers a
//! candidate whose recorded owner pid matches a live rsession and only
//! falls back to the newest snapshot when no candidate matches.

use crate::error::{BridgeError, BridgeResult};
use crate::process;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Snapshot file holding `key="value"` pairs, including the client id
pub const PERSISTENT_STATE_FILE: &str = "session-persistent-state";

/// Environment snapshot written when the session suspends
pub const ENVIRONMENT_VARS_FILE: &str = "suspended-session-data/environment_vars";

pub const ENV_SESSION_PID: &str = "RSTUDIO_SESSION_PID";
pub const ENV_SESSION_STREAM: &str = "RSTUDIO_SESSION_STREAM";
pub const ENV_PORT_TOKEN: &str = "RS_PORT_TOKEN";

/// Extract the value of a `key="value"` line from a snapshot file.
/// Missing files and missing keys both yield an empty string; snapshot
/// readers never fail hard.
pub fn extract_kv_value(path: &Path, key: &str) -> String {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let pattern = format!("^{}=\"(.*)\"$", regex::escape(key));
    let Ok(re) = Regex::new(&pattern) else {
        return String::new();
    };
    for line in contents.lines() {
        if let Some(caps) = re.captures(line) {
            return caps[1].to_string();
        }
    }
    String::new()
}

/// Locate a per-session property file, tolerating both the `properites`
/// spelling the server actually writes and the corrected `properties`.
pub fn session_property_file(session_dir: &Path, key: &str) -> Option<PathBuf> {
    for spelling in ["properites", "properties"] {
        let candidate = session_dir.join(spelling).join(key);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Read the console `executing` flag, whitespace-stripped. Returns an
/// empty string when the file is missing or unreadable.
pub fn executing_flag_value(session_dir: &Path) -> String {
    let Some(path) = session_property_file(session_dir, "executing") else {
        return String::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => contents.split_whitespace().collect(),
        Err(_) => String::new(),
    }
}

/// Busy precheck: true when the live console is mid-execution.
pub fn is_session_busy(session_dir: &Path) -> bool {
    executing_flag_value(session_dir) == "1"
}

/// Everything one dispatch needs to know about the target session.
/// Resolved fresh per dispatch; the live session can restart at any time,
/// so descriptors are never cached.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub dir: PathBuf,
    pub client_id: String,
    pub abend: String,
    pub env_session_pid: String,
}

impl SessionDescriptor {
    pub fn read(dir: &Path) -> BridgeResult<Self> {
        let state_file = dir.join(PERSISTENT_STATE_FILE);
        let client_id = extract_kv_value(&state_file, "active-client-id");
        if client_id.is_empty() {
            return Err(BridgeError::SessionNotFound(format!(
                "active-client-id not found in {}",
                state_file.display()
            )));
        }
        let abend = extract_kv_value(&state_file, "abend");
        let env_session_pid =
            extract_kv_value(&dir.join(ENVIRONMENT_VARS_FILE), ENV_SESSION_PID);
        Ok(Self {
            dir: dir.to_path_buf(),
            client_id,
            abend,
            env_session_pid,
        })
    }
}

/// Finder for active session directories, with an injectable root and
/// liveness probe so the search is testable without a live server.
pub struct SessionStore {
    root: PathBuf,
    pid_alive: fn(&str) -> bool,
}

impl Default for SessionStore {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(".local/share/rstudio/sessions/active");
        Self {
            root,
            pid_alive: process::is_rsession_alive,
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(root: impl Into<PathBuf>, pid_alive: fn(&str) -> bool) -> Self {
        Self {
            root: root.into(),
            pid_alive,
        }
    }

    pub fn pid_alive(&self, pid: &str) -> bool {
        (self.pid_alive)(pid)
    }

    /// Candidate session directories, newest modification time first.
    pub fn active_session_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut dirs: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_name().to_string_lossy().starts_with("session-")
                    && entry.path().is_dir()
            })
            .filter_map(|entry| {
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((mtime, entry.path()))
            })
            .collect();
        dirs.sort_by(|a, b| b.0.cmp(&a.0));
        dirs.into_iter().map(|(_, path)| path).collect()
    }

    /// Resolve the directory of the live target session.
    ///
    /// An explicit directory must contain the snapshot file, with no
    /// fallback search. Otherwise the caller's own `RSTUDIO_SESSION_PID`
    /// hint is matched against each candidate's recorded owner pid, and
    /// only when that fails does the newest snapshot-bearing candidate
    /// win.
    pub fn resolve(&self, explicit: Option<&Path>) -> BridgeResult<PathBuf> {
        let current_pid = std::env::var(ENV_SESSION_PID).unwrap_or_default();
        self.resolve_with_hint(explicit, &current_pid)
    }

    /// `resolve` with the caller's process-identity hint made explicit.
    pub fn resolve_with_hint(
        &self,
        explicit: Option<&Path>,
        current_pid: &str,
    ) -> BridgeResult<PathBuf> {
        if let Some(dir) = explicit {
            if !dir.join(PERSISTENT_STATE_FILE).exists() {
                return Err(BridgeError::SessionNotFound(format!(
                    "specified session-dir is missing {}: {}",
                    PERSISTENT_STATE_FILE,
                    dir.display()
                )));
            }
            return Ok(dir.to_path_buf());
        }

        if self.pid_alive(current_pid) {
            for candidate in self.active_session_dirs() {
                if !candidate.join(PERSISTENT_STATE_FILE).exists()
                    || !candidate.join(ENVIRONMENT_VARS_FILE).exists()
                {
                    continue;
                }
                let env_pid =
                    extract_kv_value(&candidate.join(ENVIRONMENT_VARS_FILE), ENV_SESSION_PID);
                if env_pid == current_pid {
                    debug!(session_dir = %candidate.display(), "resolved session by owner pid");
                    return Ok(candidate);
                }
            }
        }

        for candidate in self.active_session_dirs() {
            if candidate.join(PERSISTENT_STATE_FILE).exists() {
                debug!(session_dir = %candidate.display(), "resolved newest snapshot-bearing session");
                return Ok(candidate);
            }
        }

        Err(BridgeError::SessionNotFound(
            "no active session state file found.".to_string(),
        ))
    }

    /// Bring the caller's environment in line with the target session.
    ///
    /// Live values always win: the snapshot is only applied when the
    /// stream/token pair is incomplete or the recorded owner is gone.
    /// Stale snapshot values over live ones are a known way to break
    /// postback auth.
    pub fn load_session_environment(&self, session_dir: &Path) {
        let env_file = session_dir.join(ENVIRONMENT_VARS_FILE);
        let current_stream = std::env::var(ENV_SESSION_STREAM).unwrap_or_default();
        let current_token = std::env::var(ENV_PORT_TOKEN).unwrap_or_default();
        let current_pid = std::env::var(ENV_SESSION_PID).unwrap_or_default();

        if !current_stream.is_empty()
            && !current_token.is_empty()
            && self.pid_alive(&current_pid)
        {
            return;
        }

        if env_file.exists() {
            let file_pid = extract_kv_value(&env_file, ENV_SESSION_PID);
            if self.pid_alive(&file_pid) {
                apply_env_file(&env_file);
            }
        }

        let stream_missing = std::env::var(ENV_SESSION_STREAM).unwrap_or_default().is_empty();
        let token_missing = std::env::var(ENV_PORT_TOKEN).unwrap_or_default().is_empty();
        if (stream_missing || token_missing) && env_file.exists() {
            warn!("applying suspended-session environment snapshot; values may be stale");
            apply_env_file(&env_file);
        }

        let env_pid = std::env::var(ENV_SESSION_PID).unwrap_or_default();
        let stream_missing = std::env::var(ENV_SESSION_STREAM).unwrap_or_default().is_empty();
        if stream_missing && self.pid_alive(&env_pid) {
            if let Some(stream) = process::infer_stream_from_pid(&env_pid) {
                std::env::set_var(ENV_SESSION_STREAM, stream);
            }
        }
    }
}

/// Apply every `key="value"` line of an environment snapshot into the
/// caller's environment.
pub fn apply_env_file(env_file: &Path) {
    let Ok(contents) = std::fs::read_to_string(env_file) else {
        return;
    };
    let re = Regex::new("^([A-Za-z_][A-Za-z0-9_]*)=\"(.*)\"$").expect("static pattern");
    for line in contents.lines() {
        if let Some(caps) = re.captures(line) {
            std::env::set_var(&caps[1], &caps[2]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_session(root: &Path, name: &str, client_id: Option<&str>, env_pid: Option<&str>) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(cid) = client_id {
            fs::write(
                dir.join(PERSISTENT_STATE_FILE),
                format!("active-client-id=\"{cid}\"\nabend=\"0\"\n"),
            )
            .unwrap();
        }
        if let Some(pid) = env_pid {
            let env_dir = dir.join("suspended-session-data");
            fs::create_dir_all(&env_dir).unwrap();
            fs::write(
                env_dir.join("environment_vars"),
                format!("{ENV_SESSION_PID}=\"{pid}\"\nRS_PORT_TOKEN=\"tok\"\n"),
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn kv_extraction_handles_missing_file_and_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state");
        assert_eq!(extract_kv_value(&path, "abend"), "");

        fs::write(&path, "abend=\"1\"\nactive-client-id=\"abc-123\"\n").unwrap();
        assert_eq!(extract_kv_value(&path, "abend"), "1");
        assert_eq!(extract_kv_value(&path, "active-client-id"), "abc-123");
        assert_eq!(extract_kv_value(&path, "missing"), "");
    }

    #[test]
    fn property_file_tolerates_both_spellings() {
        let temp = TempDir::new().unwrap();
        assert!(session_property_file(temp.path(), "executing").is_none());

        fs::create_dir_all(temp.path().join("properties")).unwrap();
        fs::write(temp.path().join("properties/executing"), "0").unwrap();
        let found = session_property_file(temp.path(), "executing").unwrap();
        assert!(found.ends_with("properties/executing"));

        // The server's original spelling wins when both exist
        fs::create_dir_all(temp.path().join("properites")).unwrap();
        fs::write(temp.path().join("properites/executing"), "1").unwrap();
        let found = session_property_file(temp.path(), "executing").unwrap();
        assert!(found.ends_with("properites/executing"));
    }

    #[test]
    fn busy_flag_requires_exact_one() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("properites")).unwrap();
        fs::write(temp.path().join("properites/executing"), " 1 \n").unwrap();
        assert!(is_session_busy(temp.path()));

        fs::write(temp.path().join("properites/executing"), "0").unwrap();
        assert!(!is_session_busy(temp.path()));
    }

    #[test]
    fn explicit_dir_without_snapshot_fails_without_fallback() {
        let temp = TempDir::new().unwrap();
        make_session(temp.path(), "session-ok", Some("cid"), None);
        let store = SessionStore::with_probe(temp.path(), |_| false);

        let empty = temp.path().join("session-empty");
        fs::create_dir_all(&empty).unwrap();
        let err = store.resolve(Some(&empty)).unwrap_err();
        assert!(matches!(err, BridgeError::SessionNotFound(_)));
    }

    #[test]
    fn resolve_prefers_owner_pid_match_over_newest() {
        let temp = TempDir::new().unwrap();
        let matching = make_session(temp.path(), "session-old", Some("cid-a"), Some("4242"));
        make_session(temp.path(), "session-new", Some("cid-b"), Some("9999"));

        let store = SessionStore::with_probe(temp.path(), |_| true);
        let resolved = store.resolve_with_hint(None, "4242").unwrap();
        assert_eq!(resolved, matching);
    }

    #[test]
    fn resolve_falls_back_to_snapshot_bearing_candidate() {
        let temp = TempDir::new().unwrap();
        let no_snapshot = temp.path().join("session-bare");
        fs::create_dir_all(&no_snapshot).unwrap();
        let with_snapshot = make_session(temp.path(), "session-real", Some("cid"), None);

        let store = SessionStore::with_probe(temp.path(), |_| false);
        assert_eq!(store.resolve_with_hint(None, "").unwrap(), with_snapshot);
    }

    #[test]
    fn resolve_fails_when_nothing_has_a_snapshot() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::with_probe(temp.path(), |_| false);
        assert!(matches!(
            store.resolve_with_hint(None, "").unwrap_err(),
            BridgeError::SessionNotFound(_)
        ));
    }

    #[test]
    fn descriptor_requires_client_id() {
        let temp = TempDir::new().unwrap();
        let dir = make_session(temp.path(), "session-x", Some("client-7"), Some("77"));
        let descriptor = SessionDescriptor::read(&dir).unwrap();
        assert_eq!(descriptor.client_id, "client-7");
        assert_eq!(descriptor.abend, "0");
        assert_eq!(descriptor.env_session_pid, "77");

        let bare = temp.path().join("session-none");
        fs::create_dir_all(&bare).unwrap();
        assert!(SessionDescriptor::read(&bare).is_err());
    }
}
