//! Wire types shared by the daemon, the token tracker and requesters.
//!
//! Everything here is a plain value: termination requests are written once by
//! a requester and consumed once by the daemon, usage snapshots are produced on
//! demand and only ever appended to a history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a session is being asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TokenLimitApproaching,
    Manual,
    Error,
    Other,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::TokenLimitApproaching => "token_limit_approaching",
            TerminationReason::Manual => "manual",
            TerminationReason::Error => "error",
            TerminationReason::Other => "other",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long the session gets between SIGTERM and SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPriority {
    #[default]
    Graceful,
    Immediate,
}

impl TerminationPriority {
    /// Time allowed for the process to exit after SIGTERM.
    pub fn exit_timeout(&self) -> Duration {
        match self {
            TerminationPriority::Graceful => Duration::from_secs(30),
            TerminationPriority::Immediate => Duration::from_secs(5),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationPriority::Graceful => "graceful",
            TerminationPriority::Immediate => "immediate",
        }
    }
}

impl fmt::Display for TerminationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON payload of a workspace's `termination-request` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRequest {
    pub reason: TerminationReason,
    /// Command line used to relaunch the session. Empty means "do not restart".
    #[serde(default)]
    pub continuation_command: String,
    #[serde(default)]
    pub priority: TerminationPriority,
    /// Diagnostic snapshot taken when the request was written.
    #[serde(default)]
    pub token_usage_pct: f64,
    pub pid: i32,
    pub workspace_id: String,
}

impl TerminationRequest {
    pub fn wants_restart(&self) -> bool {
        !self.continuation_command.trim().is_empty()
    }
}

/// Where a token estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    SessionLog,
    Transcript,
    NoFiles,
    SessionLogMissing,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageSource::SessionLog => "session_log",
            UsageSource::Transcript => "transcript",
            UsageSource::NoFiles => "no_files",
            UsageSource::SessionLogMissing => "session_log_missing",
        }
    }
}

impl fmt::Display for UsageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approximate token usage of a session at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageSnapshot {
    pub estimated_tokens: u64,
    pub usage_pct: f64,
    pub source: UsageSource,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TokenUsageSnapshot {
    pub fn new(estimated_tokens: u64, usage_pct: f64, source: UsageSource) -> Self {
        Self {
            estimated_tokens,
            usage_pct,
            source,
            timestamp: Utc::now(),
        }
    }

    /// A zero reading, used whenever there is nothing to measure.
    pub fn empty(source: UsageSource) -> Self {
        Self::new(0, 0.0, source)
    }
}
