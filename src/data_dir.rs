use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Workspace ids are a single path component of safe characters.
static WORKSPACE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

/// Manages the state-root layout (default `.codex/`).
///
/// The daemon's own control files live directly under the root; session
/// records live under `sessions/`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.codex/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the daemon's own PID file.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("session_monitor.pid")
    }

    /// Path to the singleton lock file held while the daemon runs.
    pub fn lock(&self) -> PathBuf {
        self.root.join("session_monitor.lock")
    }

    /// Path to the health snapshot rewritten every cycle.
    pub fn status(&self) -> PathBuf {
        self.root.join("session_monitor.status")
    }

    /// Where a detached daemon's stdout/stderr go.
    pub fn daemon_log(&self) -> PathBuf {
        self.root.join("session_monitor.log")
    }

    /// Path to the session store directory.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Create the root directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}

/// Control-file layout of one workspace under `workspace_base_dir`.
#[derive(Debug, Clone)]
pub struct WorkspaceDir {
    id: String,
    path: PathBuf,
}

impl WorkspaceDir {
    pub fn new(workspace_base_dir: &Path, workspace_id: &str) -> Self {
        Self {
            id: workspace_id.to_string(),
            path: workspace_base_dir.join(workspace_id),
        }
    }

    /// Build from an existing workspace directory; the id is its file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { id, path }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// The supervised session's PID file.
    pub fn session_pid(&self) -> PathBuf {
        self.path.join("session.pid")
    }

    pub fn termination_request(&self) -> PathBuf {
        self.path.join(TERMINATION_REQUEST_FILE)
    }

    /// Plain-text transcript written by the session itself.
    pub fn session_log(&self) -> PathBuf {
        self.path.join("session.log")
    }

    /// Where a restarted session's stdout/stderr are appended.
    pub fn restart_log(&self) -> PathBuf {
        self.path.join("restart.log")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.path.join("checkpoint.json")
    }
}

pub const TERMINATION_REQUEST_FILE: &str = "termination-request";

/// True if `id` can safely name a directory under `workspace_base_dir`.
pub fn is_valid_workspace_id(id: &str) -> bool {
    id != "." && id != ".." && WORKSPACE_ID.is_match(id)
}

/// Immediate subdirectories of `workspace_base_dir`, sorted by name.
/// A missing base directory has no workspaces.
pub fn list_workspaces(workspace_base_dir: &Path) -> Vec<WorkspaceDir> {
    let entries = match std::fs::read_dir(workspace_base_dir) {
        Ok(e) => e,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    error = %e,
                    path = %workspace_base_dir.display(),
                    "failed to read workspace directory"
                );
            }
            return Vec::new();
        }
    };

    let mut workspaces: Vec<WorkspaceDir> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .map(WorkspaceDir::from_path)
        .collect();
    workspaces.sort_by(|a, b| a.id.cmp(&b.id));
    workspaces
}

/// Read a PID file: a single integer, surrounding whitespace ignored.
pub fn read_pid_file(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Atomically replace a PID file with `pid`.
pub fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    write_atomic(path, format!("{pid}\n").as_bytes())
}

/// Write `bytes` to `path` via a sibling temp file and a rename, so readers
/// see either the old contents or the new, never a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Delete a control file. Already gone is fine; any other failure is
/// logged with `what` naming the file.
///
/// Returns true if this call removed the file.
pub fn remove_file_if_present(path: &Path, what: &str) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove {what}");
            false
        }
    }
}
