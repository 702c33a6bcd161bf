mod checkpoint;
mod commands;
mod config;
mod daemon;
mod data_dir;
mod launcher;
mod liveness;
mod models;
mod request;
mod retry;
mod signals;
mod status;
mod token_tracker;

use clap::{Parser, Subcommand};
use commands::{CommandResult, Context, TerminationArgs};
use config::MonitorConfig;
use data_dir::DataDir;
use models::{TerminationPriority, TerminationReason};
use std::path::PathBuf;
use std::process::ExitCode;

/// Supervises long-running agent sessions: watches workspaces for
/// termination requests, shuts sessions down gracefully then forcefully,
/// and restarts them with a continuation command.
#[derive(Parser, Debug)]
#[command(name = "session-monitor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State root holding the daemon's PID, lock and status files
    #[arg(long, global = true, default_value = ".codex")]
    root: PathBuf,

    /// Config file path (default: <root>/session_monitor.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the monitor daemon in the background
    Start,

    /// Stop the running daemon
    Stop,

    /// Show daemon state and token usage of a workspace
    Status {
        /// Remove a stale daemon PID file
        #[arg(long)]
        clean: bool,

        /// Workspace id (default: current directory name)
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Ask the daemon to terminate (and optionally restart) a session
    RequestTermination {
        #[arg(long, value_parser = parse_reason)]
        reason: TerminationReason,

        /// Command line used to relaunch the session; empty means no restart
        #[arg(long, default_value = "")]
        continuation_command: String,

        #[arg(long, value_parser = parse_priority, default_value = "graceful")]
        priority: TerminationPriority,

        /// Session PID (default: read from the workspace's session.pid)
        #[arg(long)]
        pid: Option<i32>,

        /// Workspace id (default: current directory name)
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Estimate token usage of a workspace's session
    CheckTokens {
        /// Workspace id (default: current directory name)
        #[arg(short, long)]
        workspace: Option<String>,

        /// Append the reading to the stored session's usage history
        #[arg(long)]
        record: bool,
    },

    /// List workspaces and their session processes
    ListSessions {
        /// Remove session PID files whose process is gone
        #[arg(long)]
        clean: bool,
    },

    /// Run the daemon in the foreground (used by `start`)
    #[command(hide = true)]
    RunDaemon {
        #[arg(long)]
        config_path: PathBuf,
    },
}

fn parse_reason(s: &str) -> Result<TerminationReason, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
        format!("invalid reason {s:?} (expected token_limit_approaching, manual, error or other)")
    })
}

fn parse_priority(s: &str) -> Result<TerminationPriority, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("invalid priority {s:?} (expected graceful or immediate)"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "session_monitor=debug"
    } else {
        "session_monitor=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CommandResult {
    let data_dir = DataDir::new(&cli.root);
    let config_path = match (&cli.command, cli.config) {
        (Commands::RunDaemon { config_path }, _) => config_path.clone(),
        (_, Some(path)) => path,
        (_, None) => cli.root.join("session_monitor.toml"),
    };
    let config = MonitorConfig::load(&config_path)
        .map_err(|e| commands::CommandError::Failed(e.to_string()))?;
    let ctx = Context::new(data_dir, config, config_path);

    let workspace_or_cwd =
        |workspace: Option<String>| workspace.unwrap_or_else(commands::default_workspace_id);

    let mut out = std::io::stdout().lock();
    match cli.command {
        Commands::Start => commands::start(&ctx, &mut out).await,
        Commands::Stop => commands::stop(&ctx, &mut out).await,
        Commands::Status { clean, workspace } => {
            commands::status(&ctx, &workspace_or_cwd(workspace), clean, &mut out)
        }
        Commands::RequestTermination {
            reason,
            continuation_command,
            priority,
            pid,
            workspace,
        } => {
            let args = TerminationArgs {
                reason,
                continuation_command,
                priority,
                pid,
                workspace_id: workspace_or_cwd(workspace),
            };
            commands::request_termination(&ctx, &args, &mut out)
        }
        Commands::CheckTokens { workspace, record } => {
            commands::check_tokens(&ctx, &workspace_or_cwd(workspace), record, &mut out)
        }
        Commands::ListSessions { clean } => commands::list_sessions(&ctx, clean, &mut out),
        Commands::RunDaemon { .. } => {
            drop(out);
            commands::run_daemon(ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_termination() {
        let cli = Cli::try_parse_from([
            "session-monitor",
            "request-termination",
            "--reason",
            "token_limit_approaching",
            "--continuation-command",
            "claude --continue",
            "--priority",
            "immediate",
            "--pid",
            "5555",
        ])
        .unwrap();

        match cli.command {
            Commands::RequestTermination {
                reason,
                continuation_command,
                priority,
                pid,
                workspace,
            } => {
                assert_eq!(reason, TerminationReason::TokenLimitApproaching);
                assert_eq!(continuation_command, "claude --continue");
                assert_eq!(priority, TerminationPriority::Immediate);
                assert_eq!(pid, Some(5555));
                assert!(workspace.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_reason_rejected() {
        let result = Cli::try_parse_from([
            "session-monitor",
            "request-termination",
            "--reason",
            "bored",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "session-monitor",
            "start",
            "--config",
            "monitor.json",
            "--verbose",
            "--root",
            "/tmp/state",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert_eq!(cli.config, Some(PathBuf::from("monitor.json")));
        assert_eq!(cli.root, PathBuf::from("/tmp/state"));
        assert!(cli.verbose);
    }

    #[test]
    fn test_hidden_run_daemon() {
        let cli = Cli::try_parse_from([
            "session-monitor",
            "run-daemon",
            "--config-path",
            "monitor.toml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::RunDaemon { .. }));
    }
}
