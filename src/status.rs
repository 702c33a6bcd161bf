/// The daemon's health snapshot, rewritten as JSON at the end of every cycle
/// so other processes (the `status` command) can read it. Writes go through
/// a sibling temp file and a rename, so readers never see half a snapshot.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Read-only snapshot returned by `health_check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub daemon_running: bool,
    pub pid: u32,
    /// End of the most recent scan cycle; None before the first one.
    pub last_check: Option<DateTime<Utc>>,
    /// Workspaces whose `session.pid` names a live process.
    pub active_sessions: usize,
    pub workspace_base_dir: String,
}

/// `<root>/session_monitor.status`.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write the snapshot.
    pub fn write(&self, status: &HealthStatus) -> Result<(), StatusError> {
        let json = serde_json::to_string_pretty(status)
            .map_err(|e| StatusError::Serialize { source: e })?;
        crate::data_dir::write_atomic(&self.path, json.as_bytes()).map_err(|e| {
            StatusError::Write {
                path: self.path.clone(),
                source: e,
            }
        })
    }

    /// Read the last snapshot, if one exists and parses.
    pub fn read(&self) -> Option<HealthStatus> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Called when the daemon exits cleanly.
    pub fn remove(&self) {
        crate::data_dir::remove_file_if_present(&self.path, "status file");
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(f, "failed to write status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
        }
    }
}
