/// CLI command handlers.
///
/// Each handler maps onto one daemon, estimator or session-store operation
/// and only adds argument checks and output formatting. Output goes to the
/// supplied writer so handlers can be driven from tests.
use crate::checkpoint::SessionManager;
use crate::config::MonitorConfig;
use crate::daemon::SessionMonitorDaemon;
use crate::data_dir::{self, DataDir, WorkspaceDir};
use crate::liveness;
use crate::models::{
    TerminationPriority, TerminationReason, TerminationRequest, TokenUsageSnapshot, UsageSource,
};
use crate::request;
use crate::token_tracker::TokenTracker;
use nix::sys::signal::Signal;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// How long `stop` waits for the daemon to exit after SIGTERM.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `start` waits for the new daemon to write its PID file.
const START_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared state every command needs.
pub struct Context {
    pub data_dir: DataDir,
    pub config: MonitorConfig,
    /// The config file the daemon is started with.
    pub config_path: PathBuf,
    pub tracker: TokenTracker,
}

impl Context {
    pub fn new(data_dir: DataDir, config: MonitorConfig, config_path: PathBuf) -> Self {
        let tracker = TokenTracker::new(&config.workspace_base_dir);
        Self {
            data_dir,
            config,
            config_path,
            tracker,
        }
    }

    fn workspace(&self, workspace_id: &str) -> WorkspaceDir {
        WorkspaceDir::new(&self.config.workspace_base_dir, workspace_id)
    }

    fn session_manager(&self) -> SessionManager {
        SessionManager::new(
            self.data_dir.sessions_dir(),
            &self.config.workspace_base_dir,
        )
    }
}

/// Errors surfaced to the user; `main` prints them and exits 1.
#[derive(Debug)]
pub enum CommandError {
    Io(std::io::Error),
    Failed(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Io(e) => write!(f, "I/O error: {e}"),
            CommandError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Io(e) => Some(e),
            CommandError::Failed(_) => None,
        }
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Io(e)
    }
}

pub type CommandResult = Result<(), CommandError>;

/// The workspace id for commands run without `--workspace`: the name of
/// the current directory.
pub fn default_workspace_id() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_default()
}

/// PID of the daemon recorded under `data_dir`, if that process is alive.
pub fn running_daemon_pid(data_dir: &DataDir) -> Option<i32> {
    data_dir::read_pid_file(&data_dir.pid_file()).filter(|&pid| liveness::is_alive(pid))
}

/// Spawn a detached daemon and report its PID.
pub async fn start(ctx: &Context, out: &mut impl Write) -> CommandResult {
    if let Some(pid) = running_daemon_pid(&ctx.data_dir) {
        return Err(CommandError::Failed(format!(
            "Daemon already running (PID {pid})"
        )));
    }

    ctx.data_dir.init()?;
    // A leftover PID file would be mistaken for the new daemon's
    let pid_file = ctx.data_dir.pid_file();
    data_dir::remove_file_if_present(&pid_file, "daemon PID file");

    let log_path = ctx.data_dir.daemon_log();
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let log_stderr = log.try_clone()?;

    let exe = std::env::current_exe()?;
    let mut child = std::process::Command::new(exe)
        .arg("--root")
        .arg(ctx.data_dir.root())
        .arg("run-daemon")
        .arg("--config-path")
        .arg(&ctx.config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_stderr))
        .process_group(0)
        .spawn()
        .map_err(|e| CommandError::Failed(format!("Failed to spawn daemon: {e}")))?;
    let child_pid = child.id() as i32;
    tracing::debug!(pid = child_pid, log = %log_path.display(), "spawned daemon");

    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if data_dir::read_pid_file(&pid_file) == Some(child_pid) {
            writeln!(out, "✓ Session monitor started (PID {child_pid})")?;
            writeln!(out, "  Log: {}", log_path.display())?;
            return Ok(());
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(CommandError::Failed(format!(
                "Daemon exited during startup ({status}); see {}",
                log_path.display()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    writeln!(
        out,
        "Session monitor spawned (PID {child_pid}) but has not written {} yet",
        pid_file.display()
    )?;
    Ok(())
}

/// SIGTERM the daemon, escalating to SIGKILL after `STOP_TIMEOUT`.
pub async fn stop(ctx: &Context, out: &mut impl Write) -> CommandResult {
    let pid_file = ctx.data_dir.pid_file();
    let Some(pid) = data_dir::read_pid_file(&pid_file) else {
        return Err(CommandError::Failed(format!(
            "No daemon PID file found at {}",
            pid_file.display()
        )));
    };

    if !liveness::is_alive(pid) {
        data_dir::remove_file_if_present(&pid_file, "daemon PID file");
        writeln!(out, "Daemon not running (removed stale PID file)")?;
        return Ok(());
    }

    liveness::send_signal(pid, Signal::SIGTERM)
        .map_err(|e| CommandError::Failed(format!("Failed to signal daemon (PID {pid}): {e}")))?;

    let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
    while liveness::is_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    if liveness::is_alive(pid) {
        tracing::warn!(pid, "daemon ignored SIGTERM, sending SIGKILL");
        let _ = liveness::send_signal(pid, Signal::SIGKILL);
    }

    data_dir::remove_file_if_present(&pid_file, "daemon PID file");
    writeln!(out, "✓ Session monitor stopped (PID {pid})")?;
    Ok(())
}

/// Daemon state plus the token usage of one workspace.
pub fn status(ctx: &Context, workspace_id: &str, clean: bool, out: &mut impl Write) -> CommandResult {
    let pid_file = ctx.data_dir.pid_file();
    match data_dir::read_pid_file(&pid_file) {
        Some(pid) if liveness::is_alive(pid) => {
            writeln!(out, "✓ Daemon running (PID {pid})")?;
            let status_file = crate::status::StatusFile::new(ctx.data_dir.status());
            if let Some(health) = status_file.read() {
                match health.last_check {
                    Some(at) => writeln!(out, "  Last check: {}", at.format("%Y-%m-%d %H:%M:%S UTC"))?,
                    None => writeln!(out, "  Last check: never")?,
                }
                writeln!(out, "  Active sessions: {}", health.active_sessions)?;
            }
        }
        Some(_) => {
            writeln!(out, "✗ Daemon not running (stale PID file)")?;
            if clean {
                std::fs::remove_file(&pid_file)?;
                writeln!(out, "Removed stale daemon PID file.")?;
            }
        }
        // Present but not a PID: just as stale as a dead one
        None if pid_file.exists() => {
            writeln!(out, "✗ Daemon not running (unreadable PID file)")?;
            if clean {
                std::fs::remove_file(&pid_file)?;
                writeln!(out, "Removed stale daemon PID file.")?;
            }
        }
        None => writeln!(out, "✗ Daemon not running")?,
    }

    let usage = ctx.tracker.get_current_usage(workspace_id);
    writeln!(out)?;
    writeln!(out, "Workspace: {workspace_id}")?;
    if usage.source == UsageSource::NoFiles {
        writeln!(out, "  Token usage: no session files found")?;
    } else {
        writeln!(
            out,
            "  Token usage: {:.1}% ({} tokens, {})",
            usage.usage_pct,
            format_thousands(usage.estimated_tokens),
            usage.source
        )?;
    }
    Ok(())
}

/// Arguments of `request-termination`.
#[derive(Debug, Clone)]
pub struct TerminationArgs {
    pub reason: TerminationReason,
    pub continuation_command: String,
    pub priority: TerminationPriority,
    pub pid: Option<i32>,
    pub workspace_id: String,
}

/// Write a termination request for a workspace's session.
pub fn request_termination(ctx: &Context, args: &TerminationArgs, out: &mut impl Write) -> CommandResult {
    if !data_dir::is_valid_workspace_id(&args.workspace_id) {
        return Err(CommandError::Failed(format!(
            "Invalid workspace id {:?}",
            args.workspace_id
        )));
    }
    let workspace = ctx.workspace(&args.workspace_id);

    let pid = match args.pid {
        Some(pid) => pid,
        None => {
            let pid_file = workspace.session_pid();
            data_dir::read_pid_file(&pid_file).ok_or_else(|| {
                CommandError::Failed(format!(
                    "Session PID file {} not found; pass --pid",
                    pid_file.display()
                ))
            })?
        }
    };
    if !liveness::is_alive(pid) {
        return Err(CommandError::Failed(format!(
            "Process {pid} is not running"
        )));
    }

    let usage = ctx.tracker.get_current_usage(&args.workspace_id);
    let req = TerminationRequest {
        reason: args.reason,
        continuation_command: args.continuation_command.clone(),
        priority: args.priority,
        token_usage_pct: usage.usage_pct,
        pid,
        workspace_id: args.workspace_id.clone(),
    };

    std::fs::create_dir_all(workspace.path())?;
    let path = workspace.termination_request();
    if path.exists() {
        tracing::warn!(path = %path.display(), "replacing unconsumed termination request");
    }
    request::write_request(&path, &req).map_err(|e| CommandError::Failed(e.to_string()))?;

    writeln!(out, "✓ Termination request written: {}", path.display())?;
    writeln!(out, "  PID: {pid}")?;
    writeln!(out, "  Reason: {}", req.reason)?;
    writeln!(out, "  Priority: {}", req.priority)?;
    if req.wants_restart() {
        writeln!(out, "  Continuation: {}", req.continuation_command)?;
    }
    Ok(())
}

/// Print token usage and its threshold classification.
///
/// With `record`, the reading is also appended to the workspace's stored
/// session record, if there is one.
pub fn check_tokens(
    ctx: &Context,
    workspace_id: &str,
    record: bool,
    out: &mut impl Write,
) -> CommandResult {
    let usage = ctx.tracker.get_current_usage(workspace_id);
    if usage.source == UsageSource::NoFiles {
        writeln!(out, "No session files found for workspace {workspace_id}")?;
        return Ok(());
    }

    let (level, reason) = classify(&ctx.tracker, &usage, &ctx.config);
    writeln!(out, "Workspace: {workspace_id}")?;
    writeln!(out, "  Estimated tokens: {}", format_thousands(usage.estimated_tokens))?;
    writeln!(out, "  Usage: {:.1}%", usage.usage_pct)?;
    writeln!(out, "  Source: {}", usage.source)?;
    writeln!(out, "  Status: {level} - {reason}")?;

    if record {
        let recorded = ctx
            .session_manager()
            .record_token_usage(workspace_id, usage)
            .map_err(|e| CommandError::Failed(e.to_string()))?;
        if recorded {
            writeln!(out, "  Recorded in session history.")?;
        } else {
            writeln!(out, "  No stored session named {workspace_id}; not recorded.")?;
        }
    }
    Ok(())
}

/// `OK`, `WARNING` or `CRITICAL`, plus the tracker's explanation.
fn classify(
    tracker: &TokenTracker,
    usage: &TokenUsageSnapshot,
    config: &MonitorConfig,
) -> (&'static str, String) {
    let (terminate, reason) = tracker.should_terminate(usage, config);
    let level = if terminate {
        "CRITICAL"
    } else if usage.usage_pct >= config.token_warning_threshold {
        "WARNING"
    } else {
        "OK"
    };
    (level, reason)
}

/// One line per workspace with its session PID state and usage, followed
/// by the stored session records.
pub fn list_sessions(ctx: &Context, clean: bool, out: &mut impl Write) -> CommandResult {
    let workspaces = data_dir::list_workspaces(&ctx.config.workspace_base_dir);
    if workspaces.is_empty() {
        writeln!(
            out,
            "No workspaces found in {}",
            ctx.config.workspace_base_dir.display()
        )?;
    }

    for ws in &workspaces {
        let pid_file = ws.session_pid();
        match data_dir::read_pid_file(&pid_file) {
            Some(pid) => {
                let alive = liveness::is_alive(pid);
                let state = if alive { "running" } else { "stopped" };
                writeln!(out, "{}: PID {pid} ({state})", ws.id())?;
                if !alive && clean {
                    std::fs::remove_file(&pid_file)?;
                    writeln!(out, "  Cleanup: removed stale session PID file.")?;
                }
            }
            None => writeln!(out, "{}: no session PID", ws.id())?,
        }

        let usage = ctx.tracker.get_current_usage(ws.id());
        if usage.source != UsageSource::NoFiles {
            writeln!(
                out,
                "  Tokens: {} ({:.1}%, {})",
                format_thousands(usage.estimated_tokens),
                usage.usage_pct,
                usage.source
            )?;
        }
    }

    let stored = ctx
        .session_manager()
        .list_sessions()
        .map_err(|e| CommandError::Failed(e.to_string()))?;
    if !stored.is_empty() {
        writeln!(out)?;
        writeln!(out, "Stored sessions:")?;
        for state in &stored {
            let checkpoint = match state.last_checkpoint_at {
                Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                None => "none".to_string(),
            };
            writeln!(
                out,
                "  {} ({}): {} readings, last checkpoint {checkpoint}",
                state.session_id(),
                state.metadata.name,
                state.token_usage_history.len()
            )?;
        }
    }
    Ok(())
}

/// Run the daemon in this process until signalled.
pub async fn run_daemon(ctx: Context) -> CommandResult {
    let mut daemon = SessionMonitorDaemon::new(ctx.config, ctx.data_dir);
    crate::signals::install(daemon.handle())?;
    daemon
        .start()
        .await
        .map_err(|e| CommandError::Failed(e.to_string()))
}

/// `85000` -> `85,000`.
pub fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
