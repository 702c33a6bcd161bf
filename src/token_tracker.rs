//! Token usage estimation from session transcripts.
//!
//! Counts whitespace-separated words and scales by a fixed tokens-per-word
//! ratio. The budget is a fixed 100k tokens; `usage_pct` is the share of it
//! consumed so far.

use crate::config::MonitorConfig;
use crate::data_dir::{self, WorkspaceDir};
use crate::models::{TokenUsageSnapshot, UsageSource};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Approximate tokens per whitespace-separated word.
const TOKENS_PER_WORD: f64 = 1.3;

/// Token count treated as 100% usage.
const TOKEN_BUDGET: f64 = 100_000.0;

/// Estimates token usage for workspaces.
///
/// Prefers the structured transcript kept by the agent tool under
/// `transcript_root`, falling back to the workspace's plain `session.log`.
#[derive(Debug, Clone)]
pub struct TokenTracker {
    workspace_base_dir: PathBuf,
    transcript_root: Option<PathBuf>,
}

impl TokenTracker {
    /// Tracker reading transcripts from `~/.config/claude/projects`.
    pub fn new(workspace_base_dir: impl Into<PathBuf>) -> Self {
        let transcript_root =
            dirs::home_dir().map(|home| home.join(".config").join("claude").join("projects"));
        Self {
            workspace_base_dir: workspace_base_dir.into(),
            transcript_root,
        }
    }

    /// Override where structured transcripts are looked up.
    pub fn with_transcript_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.transcript_root = Some(root.into());
        self
    }

    /// Estimate from a plain-text session log.
    ///
    /// Invalid UTF-8 is replaced rather than rejected, so a log with stray
    /// binary output still yields an estimate.
    pub fn estimate_from_session_log(&self, path: &Path) -> TokenUsageSnapshot {
        if !path.exists() {
            return TokenUsageSnapshot::empty(UsageSource::SessionLogMissing);
        }

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read session log");
                return TokenUsageSnapshot::empty(UsageSource::SessionLog);
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        snapshot_for_words(count_words(&text), UsageSource::SessionLog)
    }

    /// Estimate from a JSONL transcript of user/assistant records.
    ///
    /// Lines that fail to parse are skipped.
    pub fn estimate_from_transcript(&self, path: &Path) -> TokenUsageSnapshot {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read transcript");
                return TokenUsageSnapshot::empty(UsageSource::Transcript);
            }
        };
        let text = String::from_utf8_lossy(&bytes);

        let mut words = 0usize;
        let mut skipped = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(record) => {
                    for fragment in record_text(&record) {
                        words += count_words(fragment);
                    }
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, path = %path.display(), "skipped malformed transcript lines");
        }

        snapshot_for_words(words, UsageSource::Transcript)
    }

    /// Current usage for a workspace: transcript first, then session log.
    ///
    /// An id that is not a single safe path component has no files.
    pub fn get_current_usage(&self, workspace_id: &str) -> TokenUsageSnapshot {
        if !data_dir::is_valid_workspace_id(workspace_id) {
            tracing::debug!(workspace = %workspace_id, "invalid workspace id, no files to read");
            return TokenUsageSnapshot::empty(UsageSource::NoFiles);
        }

        if let Some(transcript) = self.transcript_path(workspace_id) {
            if transcript.is_file() {
                return self.estimate_from_transcript(&transcript);
            }
        }

        let log = WorkspaceDir::new(&self.workspace_base_dir, workspace_id).session_log();
        if log.is_file() {
            return self.estimate_from_session_log(&log);
        }

        TokenUsageSnapshot::empty(UsageSource::NoFiles)
    }

    /// `<transcript_root>/<id>/<id>.jsonl`, if a transcript root is known
    /// and the id is a valid workspace id.
    pub fn transcript_path(&self, workspace_id: &str) -> Option<PathBuf> {
        if !data_dir::is_valid_workspace_id(workspace_id) {
            return None;
        }
        self.transcript_root
            .as_ref()
            .map(|root| root.join(workspace_id).join(format!("{workspace_id}.jsonl")))
    }

    /// Decide whether usage warrants terminating the session.
    pub fn should_terminate(
        &self,
        usage: &TokenUsageSnapshot,
        config: &MonitorConfig,
    ) -> (bool, String) {
        let pct = usage.usage_pct;
        if pct >= config.token_critical_threshold {
            (
                true,
                format!(
                    "Token usage {pct:.1}% exceeds critical threshold ({:.1}%)",
                    config.token_critical_threshold
                ),
            )
        } else if pct >= config.token_warning_threshold {
            (
                false,
                format!(
                    "Token usage {pct:.1}% exceeds warning threshold ({:.1}%)",
                    config.token_warning_threshold
                ),
            )
        } else {
            (false, format!("Token usage {pct:.1}% within safe limits"))
        }
    }
}

fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

fn snapshot_for_words(words: usize, source: UsageSource) -> TokenUsageSnapshot {
    let estimated_tokens = (words as f64 * TOKENS_PER_WORD).round() as u64;
    let usage_pct = estimated_tokens as f64 / TOKEN_BUDGET * 100.0;
    TokenUsageSnapshot::new(estimated_tokens, usage_pct, source)
}

/// Text fragments of a user or assistant record; other record types yield nothing.
///
/// `message.content` is either a plain string or a list of content blocks,
/// of which only the `text` fields count.
fn record_text(record: &Value) -> Vec<&str> {
    let kind = record.get("type").and_then(Value::as_str);
    if !matches!(kind, Some("user") | Some("assistant")) {
        return Vec::new();
    }

    match record.pointer("/message/content") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const SAMPLE_LOG: &str = "
Starting session...
User: Please help me implement a function
Assistant: I'll help you implement that function. Here's how you can do it:

```python
def example_function():
    return \"Hello World\"
```

User: Thanks, that looks good.
Assistant: You're welcome! Let me know if you need any modifications.
";

    fn sample_transcript() -> Vec<Value> {
        vec![
            json!({
                "type": "user",
                "uuid": "abc123",
                "message": {"content": "Please help me implement a function"}
            }),
            json!({
                "type": "assistant",
                "uuid": "def456",
                "message": {"content": [
                    {"type": "text", "text": "I'll help you implement that function."}
                ]}
            }),
            json!({
                "type": "summary",
                "summary": "this record type is ignored entirely"
            }),
        ]
    }

    fn write_transcript(path: &Path, records: &[Value]) {
        let body: String = records.iter().map(|r| format!("{r}\n")).collect();
        std::fs::write(path, body).unwrap();
    }

    fn tracker(dir: &Path) -> TokenTracker {
        TokenTracker::new(dir.join("workspaces")).with_transcript_root(dir.join("projects"))
    }

    fn snapshot(pct: f64) -> TokenUsageSnapshot {
        TokenUsageSnapshot::new((pct * 1000.0) as u64, pct, UsageSource::SessionLog)
    }

    #[test]
    fn test_hundred_words_is_130_tokens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "word ".repeat(100)).unwrap();

        let usage = tracker(dir.path()).estimate_from_session_log(&path);
        assert_eq!(usage.estimated_tokens, 130);
        assert!((usage.usage_pct - 0.13).abs() < 1e-9);
        assert_eq!(usage.source, UsageSource::SessionLog);
    }

    #[test]
    fn test_session_log_sample() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, SAMPLE_LOG).unwrap();

        let usage = tracker(dir.path()).estimate_from_session_log(&path);
        assert!(usage.estimated_tokens > 0);
        assert!(usage.usage_pct > 0.0);
        assert!(usage.usage_pct < 10.0);
    }

    #[test]
    fn test_missing_session_log() {
        let dir = tempdir().unwrap();
        let usage = tracker(dir.path()).estimate_from_session_log(&dir.path().join("nope.log"));
        assert_eq!(usage.estimated_tokens, 0);
        assert_eq!(usage.usage_pct, 0.0);
        assert_eq!(usage.source, UsageSource::SessionLogMissing);
    }

    #[test]
    fn test_non_utf8_log_is_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut bytes = b"\x00\x01\x02invalid ".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b' ']);
        bytes.extend_from_slice(b"utf-8 content\x03\x04");
        std::fs::write(&path, bytes).unwrap();

        let usage = tracker(dir.path()).estimate_from_session_log(&path);
        assert_eq!(usage.source, UsageSource::SessionLog);
        assert!(usage.estimated_tokens > 0);
    }

    #[test]
    fn test_transcript_counts_user_and_assistant_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        write_transcript(&path, &sample_transcript());

        let usage = tracker(dir.path()).estimate_from_transcript(&path);
        // 6 + 6 words; the summary record contributes nothing
        assert_eq!(usage.estimated_tokens, (12.0_f64 * 1.3).round() as u64);
        assert_eq!(usage.source, UsageSource::Transcript);
    }

    #[test]
    fn test_transcript_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let body = format!(
            "{}\n{{broken json\n\n{}\n",
            json!({"type": "user", "message": {"content": "one two three four five"}}),
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "six seven"}, {"type": "tool_use", "name": "Bash"}]}}),
        );
        std::fs::write(&path, body).unwrap();

        let usage = tracker(dir.path()).estimate_from_transcript(&path);
        assert_eq!(usage.estimated_tokens, (7.0_f64 * 1.3).round() as u64);
    }

    #[test]
    fn test_current_usage_prefers_transcript() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());

        let project = dir.path().join("projects").join("ws");
        std::fs::create_dir_all(&project).unwrap();
        write_transcript(&project.join("ws.jsonl"), &sample_transcript());

        let ws = dir.path().join("workspaces").join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("session.log"), SAMPLE_LOG).unwrap();

        assert_eq!(t.get_current_usage("ws").source, UsageSource::Transcript);
    }

    #[test]
    fn test_current_usage_falls_back_to_session_log() {
        let dir = tempdir().unwrap();
        let ws = dir.path().join("workspaces").join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("session.log"), SAMPLE_LOG).unwrap();

        let usage = tracker(dir.path()).get_current_usage("ws");
        assert_eq!(usage.source, UsageSource::SessionLog);
        assert!(usage.estimated_tokens > 0);
    }

    #[test]
    fn test_current_usage_no_files() {
        let dir = tempdir().unwrap();
        let usage = tracker(dir.path()).get_current_usage("non_existent_workspace");
        assert_eq!(usage.estimated_tokens, 0);
        assert_eq!(usage.usage_pct, 0.0);
        assert_eq!(usage.source, UsageSource::NoFiles);
    }

    #[test]
    fn test_current_usage_ignores_path_like_ids() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());

        // Reachable from the base dir only through ".."
        std::fs::create_dir_all(dir.path().join("workspaces")).unwrap();
        std::fs::write(dir.path().join("session.log"), "word ".repeat(100)).unwrap();
        std::fs::create_dir_all(dir.path().join("projects")).unwrap();
        write_transcript(&dir.path().join("projects").join("...jsonl"), &sample_transcript());

        for id in ["..", ".", "", "a/b", "../workspaces"] {
            let usage = t.get_current_usage(id);
            assert_eq!(usage.source, UsageSource::NoFiles, "id {id:?}");
            assert_eq!(usage.estimated_tokens, 0);
        }
        assert!(t.transcript_path("..").is_none());
        assert!(t.transcript_path("ws").is_some());
    }

    #[test]
    fn test_should_terminate_thresholds() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        let config = MonitorConfig::default();

        let (stop, reason) = t.should_terminate(&snapshot(70.0), &config);
        assert!(!stop);
        assert!(reason.contains("within safe limits"));

        let (stop, reason) = t.should_terminate(&snapshot(85.0), &config);
        assert!(!stop);
        assert!(reason.contains("exceeds warning threshold"));

        let (stop, reason) = t.should_terminate(&snapshot(95.0), &config);
        assert!(stop);
        assert!(reason.contains("exceeds critical threshold"));
    }

    #[test]
    fn test_should_terminate_boundaries_are_inclusive() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        let config = MonitorConfig::default();

        let (stop, reason) = t.should_terminate(&snapshot(90.0), &config);
        assert!(stop);
        assert!(reason.contains("critical"));

        let (stop, reason) = t.should_terminate(&snapshot(80.0), &config);
        assert!(!stop);
        assert!(reason.contains("warning"));

        let (stop, _) = t.should_terminate(&snapshot(79.99), &config);
        assert!(!stop);
    }
}
