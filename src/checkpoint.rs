//! Session records and their checkpoints.
//!
//! A session record lives at `<session_dir>/<session_id>.json`; the
//! checkpoint for the same session lives in its workspace at
//! `<workspace_base_dir>/<session_id>/checkpoint.json`, where a restarted
//! session is pointed at it. Checkpoint payloads are opaque JSON.

use crate::data_dir::{self, write_atomic, WorkspaceDir};
use crate::models::TokenUsageSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub total_tokens: u64,
}

impl SessionMetadata {
    pub fn new(session_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            turns: 0,
            total_tokens: 0,
        }
    }

    /// Bump `updated_at` to now.
    pub fn update(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Everything persisted about one session.
///
/// The last three fields were added after the first records were written,
/// so they all default when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub checkpoint_data: Option<Value>,
    #[serde(default)]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_usage_history: Vec<TokenUsageSnapshot>,
}

impl SessionState {
    pub fn new(metadata: SessionMetadata) -> Self {
        Self {
            metadata,
            messages: Vec::new(),
            context: Map::new(),
            config: Map::new(),
            checkpoint_data: None,
            last_checkpoint_at: None,
            token_usage_history: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    /// Replace the checkpoint payload and stamp the time.
    pub fn create_checkpoint(&mut self, data: Value) {
        self.checkpoint_data = Some(data);
        self.last_checkpoint_at = Some(Utc::now());
    }

    /// The stored checkpoint payload, or None if none was ever created.
    pub fn restore_from_checkpoint(&self) -> Option<&Value> {
        self.checkpoint_data.as_ref()
    }

    /// Append to the usage history. No deduplication, no cap.
    pub fn record_token_usage(&mut self, usage: TokenUsageSnapshot) {
        self.token_usage_history.push(usage);
    }
}

/// On-disk checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub session_id: String,
    pub checkpoint_data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Stores session records and checkpoints.
#[derive(Debug, Clone)]
pub struct SessionManager {
    session_dir: PathBuf,
    workspace_base_dir: PathBuf,
}

impl SessionManager {
    pub fn new(session_dir: impl Into<PathBuf>, workspace_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            workspace_base_dir: workspace_base_dir.into(),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir.join(format!("{session_id}.json"))
    }

    /// Where the checkpoint for `session_id` is kept.
    pub fn checkpoint_path(&self, session_id: &str) -> PathBuf {
        WorkspaceDir::new(&self.workspace_base_dir, session_id).checkpoint()
    }

    /// Atomically write the record to `<session_dir>/<id>.json`.
    pub fn save_session(&self, state: &SessionState) -> Result<PathBuf, CheckpointError> {
        let id = checked_id(state.session_id())?;
        std::fs::create_dir_all(&self.session_dir).map_err(|e| CheckpointError::Write {
            path: self.session_dir.clone(),
            source: e,
        })?;

        let path = self.session_path(id);
        write_json(&path, state)?;
        tracing::debug!(session = %id, path = %path.display(), "saved session");
        Ok(path)
    }

    /// Load a session record. A missing record is `Ok(None)`.
    pub fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, CheckpointError> {
        let id = checked_id(session_id)?;
        read_json(&self.session_path(id))
    }

    /// Every stored session, most recently updated first.
    ///
    /// Records that fail to parse are skipped with a warning.
    pub fn list_sessions(&self) -> Result<Vec<SessionState>, CheckpointError> {
        let entries = match std::fs::read_dir(&self.session_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::Read {
                    path: self.session_dir.clone(),
                    source: e,
                })
            }
        };

        let mut sessions = Vec::new();
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<SessionState>(&path) {
                Ok(Some(state)) => sessions.push(state),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable session record"),
            }
        }
        sessions.sort_by(|a, b| b.metadata.updated_at.cmp(&a.metadata.updated_at));
        Ok(sessions)
    }

    /// Overwrite the checkpoint for `session_id` and return its path.
    ///
    /// If a session record exists it takes the same payload and is re-saved.
    pub fn save_checkpoint(&self, session_id: &str, data: Value) -> Result<PathBuf, CheckpointError> {
        let id = checked_id(session_id)?;
        let path = self.checkpoint_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let record = CheckpointRecord {
            session_id: id.to_string(),
            checkpoint_data: data,
            timestamp: Utc::now(),
        };
        write_json(&path, &record)?;

        if let Some(mut state) = self.load_session(id)? {
            state.create_checkpoint(record.checkpoint_data);
            state.metadata.update();
            self.save_session(&state)?;
        }

        tracing::info!(session = %id, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    /// Load the checkpoint for `session_id`. A missing one is `Ok(None)`.
    pub fn load_checkpoint(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let id = checked_id(session_id)?;
        read_json(&self.checkpoint_path(id))
    }

    /// Prepare a session to continue: apply its checkpoint, remember the
    /// continuation command, save and return it.
    ///
    /// The checkpoint file wins over payload already in the record. A
    /// session with no record is `Ok(None)`.
    pub fn resume_session(
        &self,
        session_id: &str,
        continuation_command: &str,
    ) -> Result<Option<SessionState>, CheckpointError> {
        let Some(mut state) = self.load_session(session_id)? else {
            return Ok(None);
        };

        if let Some(record) = self.load_checkpoint(session_id)? {
            state.checkpoint_data = Some(record.checkpoint_data);
            state.last_checkpoint_at = Some(record.timestamp);
        }
        state.context.insert(
            "continuation_command".to_string(),
            Value::String(continuation_command.to_string()),
        );
        state.metadata.update();
        self.save_session(&state)?;

        tracing::info!(
            session = %session_id,
            has_checkpoint = state.checkpoint_data.is_some(),
            "resumed session"
        );
        Ok(Some(state))
    }

    /// Append a usage reading to a stored session. Returns false if there
    /// is no such session.
    pub fn record_token_usage(
        &self,
        session_id: &str,
        usage: TokenUsageSnapshot,
    ) -> Result<bool, CheckpointError> {
        let Some(mut state) = self.load_session(session_id)? else {
            return Ok(false);
        };
        state.metadata.total_tokens = usage.estimated_tokens;
        state.record_token_usage(usage);
        state.metadata.update();
        self.save_session(&state)?;
        Ok(true)
    }
}

fn checked_id(session_id: &str) -> Result<&str, CheckpointError> {
    if data_dir::is_valid_workspace_id(session_id) {
        Ok(session_id)
    } else {
        Err(CheckpointError::InvalidId(session_id.to_string()))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| CheckpointError::Serialize {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_atomic(path, json.as_bytes()).map_err(|e| CheckpointError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let contents = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| CheckpointError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Errors from the session store.
#[derive(Debug)]
pub enum CheckpointError {
    /// The id cannot be used as a file name.
    InvalidId(String),
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::InvalidId(id) => write!(f, "invalid session id {id:?}"),
            CheckpointError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            CheckpointError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            CheckpointError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            CheckpointError::Serialize { path, source } => {
                write!(f, "failed to serialize {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::InvalidId(_) => None,
            CheckpointError::Read { source, .. } => Some(source),
            CheckpointError::Write { source, .. } => Some(source),
            CheckpointError::Parse { source, .. } => Some(source),
            CheckpointError::Serialize { source, .. } => Some(source),
        }
    }
}
