/// Relaunching a session: turn a continuation command into an argument
/// vector and spawn it detached, output appended to a log file.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Everything needed to start one session process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the new process.
    pub cwd: PathBuf,
    /// stdout and stderr are both appended here.
    pub log_path: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Build a spec from a continuation command line.
    ///
    /// The line is split with POSIX shell-word rules (quotes and backslash
    /// escapes, no expansion). Returns None for an empty line or unbalanced
    /// quotes.
    pub fn from_command_line(command: &str, cwd: &Path, log_path: &Path) -> Option<Self> {
        let mut argv = split_command(command)?;
        if argv.is_empty() {
            return None;
        }
        let program = argv.remove(0);
        Some(Self {
            program,
            args: argv,
            cwd: cwd.to_path_buf(),
            log_path: log_path.to_path_buf(),
            env: Vec::new(),
        })
    }

    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }
}

/// Split a command line into words. None on unbalanced quoting.
pub fn split_command(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

/// Starts session processes. The daemon only needs the new PID back.
pub trait SessionLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, LaunchError>;
}

/// Spawns real subprocesses.
///
/// Each session gets its own process group so it outlives the daemon and
/// is not hit by signals aimed at the daemon's group. The child handle is
/// dropped after spawning; tokio reaps it in the background once it exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl SessionLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, LaunchError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|e| LaunchError::LogFile {
                path: spec.log_path.clone(),
                source: e,
            })?;
        // A second handle for stderr since File doesn't impl Clone
        let log_stderr = log.try_clone().map_err(|e| LaunchError::LogFile {
            path: spec.log_path.clone(),
            source: e,
        })?;

        tracing::info!(
            command = %spec.program,
            args = ?spec.args,
            cwd = %spec.cwd.display(),
            log = %spec.log_path.display(),
            "launching session"
        );

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_stderr))
            .process_group(0)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                program: spec.program.clone(),
                source: e,
            })?;

        child.id().ok_or(LaunchError::ExitedImmediately)
    }
}

/// Errors that can occur while launching a session.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to open the output log.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The child was already reaped before its PID could be read.
    ExitedImmediately,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::LogFile { path, source } => {
                write!(f, "failed to open session log {}: {}", path.display(), source)
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            LaunchError::ExitedImmediately => {
                write!(f, "session process exited before its PID was recorded")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::LogFile { source, .. } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::ExitedImmediately => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_command("claude --continue-session").unwrap(),
            vec!["claude", "--continue-session"]
        );
    }

    #[test]
    fn test_split_honors_quotes() {
        assert_eq!(
            split_command(r#"claude -p "resume the task" --model 'a b'"#).unwrap(),
            vec!["claude", "-p", "resume the task", "--model", "a b"]
        );
    }

    #[test]
    fn test_split_unbalanced_quote() {
        assert!(split_command(r#"claude -p "oops"#).is_none());
    }

    #[test]
    fn test_spec_from_command_line() {
        let spec = LaunchSpec::from_command_line(
            "claude --continue",
            Path::new("/ws"),
            Path::new("/ws/restart.log"),
        )
        .unwrap();
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args, vec!["--continue"]);
        assert_eq!(spec.cwd, PathBuf::from("/ws"));
    }

    #[test]
    fn test_spec_from_empty_command() {
        assert!(LaunchSpec::from_command_line("   ", Path::new("/ws"), Path::new("/l")).is_none());
    }

    /// Poll `path` until it contains `needle` or two seconds pass.
    async fn wait_for_log(path: &Path, needle: &str) -> String {
        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(path).unwrap_or_default();
            if contents.contains(needle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        contents
    }

    #[tokio::test]
    async fn test_launch_runs_in_cwd_with_env_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("restart.log");
        std::fs::write(&log_path, "earlier line\n").unwrap();

        let spec = LaunchSpec::from_command_line(
            r#"sh -c "pwd; echo ws=$SESSION_MONITOR_WORKSPACE; echo err >&2""#,
            dir.path(),
            &log_path,
        )
        .unwrap()
        .with_env("SESSION_MONITOR_WORKSPACE", "alpha");

        let pid = CommandLauncher.launch(&spec).unwrap();
        assert!(pid > 0);

        let contents = wait_for_log(&log_path, "err").await;
        assert!(contents.starts_with("earlier line\n"), "log must be appended");
        let canonical = dir.path().canonicalize().unwrap();
        assert!(contents.contains(canonical.to_str().unwrap()));
        assert!(contents.contains("ws=alpha"));
        assert!(contents.contains("err"));
    }

    #[tokio::test]
    async fn test_launch_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::from_command_line(
            "nonexistent-binary-xyz --flag",
            dir.path(),
            &dir.path().join("restart.log"),
        )
        .unwrap();

        let err = CommandLauncher.launch(&spec).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_launch_bad_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::from_command_line(
            "true",
            dir.path(),
            Path::new("/nonexistent-dir/impossible/restart.log"),
        )
        .unwrap();

        let err = CommandLauncher.launch(&spec).unwrap_err();
        assert!(matches!(err, LaunchError::LogFile { .. }));
    }
}
