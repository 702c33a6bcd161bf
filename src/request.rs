/// Termination-request files: written atomically by requesters, loaded and
/// deleted by the daemon.
///
/// Requests go through `data_dir::write_atomic`, so the daemon never sees a
/// partial request.
use crate::data_dir::{remove_file_if_present, write_atomic};
use crate::models::TerminationRequest;
use std::path::{Path, PathBuf};

/// Serialize `request` and atomically place it at `path`.
pub fn write_request(path: &Path, request: &TerminationRequest) -> Result<(), RequestError> {
    let json =
        serde_json::to_string_pretty(request).map_err(|e| RequestError::Serialize { source: e })?;
    write_atomic(path, json.as_bytes()).map_err(|e| RequestError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read and parse a request file. The file is left in place.
pub fn load_request(path: &Path) -> Result<TerminationRequest, RequestError> {
    let contents = std::fs::read(path).map_err(|e| RequestError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_slice(&contents).map_err(|e| RequestError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Delete a consumed or dropped request. A file that is already gone is fine.
pub fn remove_request(path: &Path) {
    remove_file_if_present(path, "termination request");
}

/// Errors from request file operations.
#[derive(Debug)]
pub enum RequestError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Serialize { source } => {
                write!(f, "failed to serialize termination request: {source}")
            }
            RequestError::Write { path, source } => {
                write!(
                    f,
                    "failed to write termination request {}: {source}",
                    path.display()
                )
            }
            RequestError::Read { path, source } => {
                write!(
                    f,
                    "failed to read termination request {}: {source}",
                    path.display()
                )
            }
            RequestError::Parse { path, source } => {
                write!(
                    f,
                    "malformed termination request {}: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Serialize { source } => Some(source),
            RequestError::Write { source, .. } => Some(source),
            RequestError::Read { source, .. } => Some(source),
            RequestError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TerminationPriority, TerminationReason};
    use tempfile::tempdir;

    fn sample() -> TerminationRequest {
        TerminationRequest {
            reason: TerminationReason::Manual,
            continuation_command: "claude --continue".to_string(),
            priority: TerminationPriority::Immediate,
            token_usage_pct: 42.5,
            pid: 5555,
            workspace_id: "test_workspace".to_string(),
        }
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("termination-request");

        write_request(&path, &sample()).unwrap();
        let loaded = load_request(&path).unwrap();
        assert_eq!(loaded, sample());

        // Only the target remains: the temp file was renamed into place
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_write_overwrites_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("termination-request");
        std::fs::write(&path, "stale").unwrap();

        write_request(&path, &sample()).unwrap();
        assert_eq!(load_request(&path).unwrap().pid, 5555);
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("termination-request");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_request(&path).unwrap_err();
        assert!(matches!(err, RequestError::Parse { .. }));
        assert!(err.to_string().contains("malformed termination request"));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let err = load_request(&dir.path().join("termination-request")).unwrap_err();
        assert!(matches!(err, RequestError::Read { .. }));
    }

    #[test]
    fn test_write_into_missing_dir_fails() {
        let err = write_request(
            Path::new("/nonexistent-dir/impossible/termination-request"),
            &sample(),
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::Write { .. }));
    }

    #[test]
    fn test_remove_request_tolerates_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("termination-request");
        remove_request(&path);
        std::fs::write(&path, "{}").unwrap();
        remove_request(&path);
        assert!(!path.exists());
    }
}
