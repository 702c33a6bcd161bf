//! The session monitor daemon.
//!
//! One cooperative loop: each cycle scans every workspace for a
//! `termination-request` file, validates and consumes it, runs the
//! termination state machine (SIGTERM, bounded wait, SIGKILL) and, when a
//! continuation command was given, relaunches the session with bounded
//! exponential backoff. Workspaces are processed one at a time and a cycle
//! runs to completion before the next sleep.
//!
//! Nothing that happens to a single workspace can end the loop: every
//! failure is logged and turned into an outcome value.

use crate::checkpoint::SessionManager;
use crate::config::MonitorConfig;
use crate::data_dir::{self, DataDir, WorkspaceDir, TERMINATION_REQUEST_FILE};
use crate::launcher::{CommandLauncher, LaunchSpec, SessionLauncher};
use crate::liveness;
use crate::models::TerminationRequest;
use crate::request;
use crate::retry::{RestartPolicy, RetryDecision};
use crate::status::{HealthStatus, StatusFile};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How often liveness is re-probed while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Environment variable naming the workspace of a restarted session.
pub const WORKSPACE_ENV: &str = "SESSION_MONITOR_WORKSPACE";

/// Environment variable pointing a restarted session at its checkpoint.
pub const CHECKPOINT_ENV: &str = "SESSION_MONITOR_CHECKPOINT";

/// Cloneable stop switch for a running daemon.
///
/// Stopping is cooperative: the flag is observed at the top of the loop
/// and the inter-cycle sleep is cut short, but an in-flight termination or
/// restart sequence always completes.
#[derive(Debug, Clone, Default)]
pub struct DaemonHandle {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl DaemonHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Ask the daemon to leave its loop after the current cycle.
    pub fn stop(&self) {
        self.set_running(false);
        self.wake.notify_one();
    }
}

/// What happened to one termination-request file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The file did not parse; it was deleted.
    Malformed,
    /// The target PID is not alive; the file was deleted, nothing signalled.
    StalePid { pid: i32 },
    /// The request was consumed and executed.
    Handled {
        termination: TerminationOutcome,
        restart: Option<RestartOutcome>,
    },
}

/// End state of the termination state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process exited within the priority's timeout.
    Exited,
    /// The timeout passed and SIGKILL was sent.
    ForceKilled,
    /// SIGTERM could not be delivered (e.g. permission denied).
    SignalFailed,
}

/// Result of a restart-with-backoff sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted { pid: u32, attempts: u32 },
    /// The workspace directory is gone; nothing was launched.
    WorkspaceMissing,
    /// The continuation command is empty or has unbalanced quotes.
    InvalidCommand,
    /// Every attempt failed.
    Exhausted { attempts: u32 },
}

/// Supervises the sessions under `config.workspace_base_dir`.
pub struct SessionMonitorDaemon {
    config: MonitorConfig,
    data_dir: DataDir,
    handle: DaemonHandle,
    launcher: Arc<dyn SessionLauncher>,
    last_check: Option<DateTime<Utc>>,
}

impl SessionMonitorDaemon {
    /// A stopped daemon; call `start` to run it.
    pub fn new(config: MonitorConfig, data_dir: DataDir) -> Self {
        Self {
            config,
            data_dir,
            handle: DaemonHandle::new(),
            launcher: Arc::new(CommandLauncher),
            last_check: None,
        }
    }

    /// Replace the subprocess launcher used for restarts.
    pub fn with_launcher(mut self, launcher: Arc<dyn SessionLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// The daemon's own PID file.
    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.pid_file()
    }

    /// Run the daemon until stopped.
    ///
    /// Takes the singleton lock and writes the PID file first; both are
    /// released, and the PID and status files removed, when the loop ends.
    pub async fn start(&mut self) -> Result<(), DaemonError> {
        self.data_dir.init().map_err(|e| DaemonError::Init {
            path: self.data_dir.root().to_path_buf(),
            source: e,
        })?;

        let lock_path = self.data_dir.lock();
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| DaemonError::Lock {
                path: lock_path.clone(),
                source: e,
            })?;
        if let Err(e) = lock.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(DaemonError::AlreadyRunning { path: lock_path });
            }
            return Err(DaemonError::Lock {
                path: lock_path,
                source: e,
            });
        }

        let pid = std::process::id();
        let pid_file = self.pid_file();
        data_dir::write_pid_file(&pid_file, pid).map_err(|e| DaemonError::PidFile {
            path: pid_file.clone(),
            source: e,
        })?;

        self.handle.set_running(true);
        tracing::info!(
            pid,
            workspace_base_dir = %self.config.workspace_base_dir.display(),
            interval_secs = self.config.check_interval_seconds,
            "session monitor started"
        );

        self.run_loop().await;

        // Only remove the PID file if it is still ours
        if data_dir::read_pid_file(&pid_file) == Some(pid as i32) {
            data_dir::remove_file_if_present(&pid_file, "daemon PID file");
        }
        StatusFile::new(self.data_dir.status()).remove();
        tracing::info!(pid, "session monitor stopped");
        drop(lock);
        Ok(())
    }

    async fn run_loop(&mut self) {
        let interval = Duration::from_secs(self.config.check_interval_seconds);
        let status_file = StatusFile::new(self.data_dir.status());

        while self.handle.is_running() {
            self.scan_and_process_requests().await;
            self.last_check = Some(Utc::now());

            if let Err(e) = status_file.write(&self.health_check()) {
                tracing::warn!(error = %e, "failed to write status file");
            }

            if !self.handle.is_running() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.handle.wake.notified() => {}
            }
        }
    }

    /// Workspaces that currently contain a termination-request file.
    pub fn scan_workspaces(&self) -> Vec<PathBuf> {
        let base = glob::Pattern::escape(&self.config.workspace_base_dir.to_string_lossy());
        let pattern = format!("{base}/*/{TERMINATION_REQUEST_FILE}");

        let paths = match glob::glob(&pattern) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, pattern = %pattern, "invalid workspace scan pattern");
                return Vec::new();
            }
        };

        let mut workspaces: Vec<PathBuf> = paths
            .flatten()
            .filter(|path| path.is_file())
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        workspaces.sort();
        workspaces
    }

    /// One polling cycle. Returns how many request files were looked at.
    pub async fn scan_and_process_requests(&self) -> usize {
        let workspaces = self.scan_workspaces();
        if !workspaces.is_empty() {
            tracing::debug!(count = workspaces.len(), "found termination requests");
        }

        for workspace in &workspaces {
            let request_file = workspace.join(TERMINATION_REQUEST_FILE);
            let outcome = self.handle_termination_request(&request_file).await;
            tracing::debug!(workspace = %workspace.display(), ?outcome, "request processed");
        }
        workspaces.len()
    }

    /// Load, validate, consume and execute one request file.
    pub async fn handle_termination_request(&self, request_file: &Path) -> RequestOutcome {
        let req = match request::load_request(request_file) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed termination request");
                request::remove_request(request_file);
                return RequestOutcome::Malformed;
            }
        };

        if !data_dir::is_valid_workspace_id(&req.workspace_id) {
            tracing::warn!(
                workspace = %req.workspace_id,
                path = %request_file.display(),
                "dropping termination request with invalid workspace id"
            );
            request::remove_request(request_file);
            return RequestOutcome::Malformed;
        }

        let dir_name = request_file
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string());
        if dir_name.as_deref() != Some(req.workspace_id.as_str()) {
            tracing::warn!(
                workspace = %req.workspace_id,
                directory = ?dir_name,
                "termination request workspace id does not match its directory"
            );
        }

        if !self.validate_request(&req) {
            tracing::info!(
                pid = req.pid,
                workspace = %req.workspace_id,
                "target process not alive, dropping termination request"
            );
            request::remove_request(request_file);
            return RequestOutcome::StalePid { pid: req.pid };
        }

        // Consume before acting so the request can never run twice
        request::remove_request(request_file);

        tracing::info!(
            pid = req.pid,
            workspace = %req.workspace_id,
            reason = %req.reason,
            priority = %req.priority,
            token_usage_pct = req.token_usage_pct,
            "executing termination request"
        );

        let termination = self.terminate_session(&req).await;
        let restart = match termination {
            TerminationOutcome::SignalFailed => None,
            _ if req.wants_restart() => Some(self.restart_session(&req).await),
            _ => None,
        };

        RequestOutcome::Handled {
            termination,
            restart,
        }
    }

    /// A request is only acted on while its target process is alive.
    pub fn validate_request(&self, req: &TerminationRequest) -> bool {
        liveness::is_alive(req.pid)
    }

    /// SIGTERM, wait up to the priority's timeout, then SIGKILL.
    ///
    /// The SIGKILL is not followed by another liveness check.
    pub async fn terminate_session(&self, req: &TerminationRequest) -> TerminationOutcome {
        let pid = req.pid;
        match liveness::send_signal(pid, Signal::SIGTERM) {
            Ok(()) => tracing::info!(pid, "sent SIGTERM"),
            Err(Errno::ESRCH) => {
                tracing::info!(pid, "process exited before SIGTERM");
                return TerminationOutcome::Exited;
            }
            Err(e) => {
                tracing::error!(pid, error = %e, "failed to send SIGTERM");
                return TerminationOutcome::SignalFailed;
            }
        }

        let timeout = req.priority.exit_timeout();
        if self.wait_for_process_exit(pid, timeout).await {
            tracing::info!(pid, "session exited gracefully");
            return TerminationOutcome::Exited;
        }

        tracing::warn!(
            pid,
            timeout_secs = timeout.as_secs(),
            "session still alive after SIGTERM, sending SIGKILL"
        );
        if let Err(e) = liveness::send_signal(pid, Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "failed to send SIGKILL");
        }
        TerminationOutcome::ForceKilled
    }

    /// Poll liveness until the process is gone or `timeout` passes.
    /// Returns true if it exited.
    pub async fn wait_for_process_exit(&self, pid: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !liveness::is_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Relaunch the session with the request's continuation command.
    ///
    /// Launch failures are retried with exponential backoff up to
    /// `max_restart_attempts`. A missing workspace or an unusable command
    /// aborts at once, since retrying cannot fix either.
    pub async fn restart_session(&self, req: &TerminationRequest) -> RestartOutcome {
        let workspace = WorkspaceDir::new(&self.config.workspace_base_dir, &req.workspace_id);
        if !workspace.exists() {
            tracing::error!(
                workspace = %req.workspace_id,
                path = %workspace.path().display(),
                "workspace directory does not exist, not restarting session"
            );
            return RestartOutcome::WorkspaceMissing;
        }

        let Some(mut spec) = LaunchSpec::from_command_line(
            &req.continuation_command,
            workspace.path(),
            &workspace.restart_log(),
        ) else {
            tracing::error!(
                workspace = %req.workspace_id,
                command = %req.continuation_command,
                "continuation command cannot be split into arguments, not restarting session"
            );
            return RestartOutcome::InvalidCommand;
        };

        spec = spec.with_env(WORKSPACE_ENV, req.workspace_id.clone());
        let checkpoint = workspace.checkpoint();
        if checkpoint.is_file() {
            tracing::info!(
                workspace = %req.workspace_id,
                checkpoint = %checkpoint.display(),
                "resuming session from checkpoint"
            );
            spec = spec.with_env(CHECKPOINT_ENV, checkpoint.to_string_lossy().to_string());
        }

        let mut policy = RestartPolicy::new(
            self.config.max_restart_attempts,
            self.config.restart_backoff_seconds,
        );
        while let Some(attempt) = policy.begin_attempt() {
            if attempt > 1 && !workspace.exists() {
                tracing::error!(
                    workspace = %req.workspace_id,
                    attempt,
                    "workspace directory disappeared, abandoning restart"
                );
                return RestartOutcome::WorkspaceMissing;
            }

            match self.launcher.launch(&spec) {
                Ok(pid) => {
                    if let Err(e) = data_dir::write_pid_file(&workspace.session_pid(), pid) {
                        tracing::warn!(error = %e, pid, "failed to record restarted session PID");
                    }
                    tracing::info!(
                        pid,
                        attempt,
                        workspace = %req.workspace_id,
                        "session restarted"
                    );
                    self.record_resume(req);
                    return RestartOutcome::Restarted {
                        pid,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.max_restart_attempts,
                        workspace = %req.workspace_id,
                        error = %e,
                        "restart attempt failed"
                    );
                    match policy.on_failure() {
                        RetryDecision::Retry { delay, .. } => {
                            tracing::debug!(delay_secs = delay.as_secs(), "backing off before retry");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => break,
                    }
                }
            }
        }

        tracing::error!(
            attempts = policy.current_attempt(),
            workspace = %req.workspace_id,
            "restart attempts exhausted, session will not be restarted"
        );
        RestartOutcome::Exhausted {
            attempts: policy.current_attempt(),
        }
    }

    /// Note the continuation on the workspace's stored session record, if any.
    fn record_resume(&self, req: &TerminationRequest) {
        let sessions =
            SessionManager::new(self.data_dir.sessions_dir(), &self.config.workspace_base_dir);
        match sessions.resume_session(&req.workspace_id, &req.continuation_command) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(workspace = %req.workspace_id, "no stored session record to resume")
            }
            Err(e) => {
                tracing::warn!(workspace = %req.workspace_id, error = %e, "failed to update session record")
            }
        }
    }

    /// Read-only snapshot of daemon state.
    pub fn health_check(&self) -> HealthStatus {
        HealthStatus {
            daemon_running: self.is_running(),
            pid: std::process::id(),
            last_check: self.last_check,
            active_sessions: count_active_sessions(&self.config.workspace_base_dir),
            workspace_base_dir: self.config.workspace_base_dir.to_string_lossy().to_string(),
        }
    }
}

/// Workspaces whose `session.pid` names a live process.
pub fn count_active_sessions(workspace_base_dir: &Path) -> usize {
    data_dir::list_workspaces(workspace_base_dir)
        .iter()
        .filter_map(|ws| data_dir::read_pid_file(&ws.session_pid()))
        .filter(|&pid| liveness::is_alive(pid))
        .count()
}

/// Errors that stop the daemon from starting.
#[derive(Debug)]
pub enum DaemonError {
    Init {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another daemon holds the lock for this state root.
    AlreadyRunning { path: PathBuf },
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Init { path, source } => {
                write!(f, "failed to create state directory {}: {source}", path.display())
            }
            DaemonError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
            DaemonError::AlreadyRunning { path } => {
                write!(f, "another session monitor holds {}", path.display())
            }
            DaemonError::PidFile { path, source } => {
                write!(f, "failed to write PID file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Init { source, .. } => Some(source),
            DaemonError::Lock { source, .. } => Some(source),
            DaemonError::AlreadyRunning { .. } => None,
            DaemonError::PidFile { source, .. } => Some(source),
        }
    }
}
