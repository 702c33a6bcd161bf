use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process-wide daemon configuration, loaded once at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Root scanned each cycle; every immediate subdirectory is a workspace.
    pub workspace_base_dir: PathBuf,
    pub check_interval_seconds: u64,
    pub token_warning_threshold: f64,
    pub token_critical_threshold: f64,
    pub max_restart_attempts: u32,
    /// Base backoff, doubled after every failed restart attempt.
    pub restart_backoff_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workspace_base_dir: PathBuf::from(".codex/workspaces"),
            check_interval_seconds: 5,
            token_warning_threshold: 80.0,
            token_critical_threshold: 90.0,
            max_restart_attempts: 3,
            restart_backoff_seconds: 2,
        }
    }
}

impl MonitorConfig {
    /// Load config from `path`, falling back to defaults if the file is missing.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    /// The result is validated before it is returned.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config = Self::parse(path, &contents)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json {
            serde_json::from_str(contents).map_err(|e| ConfigError::Json {
                path: path.to_path_buf(),
                source: e,
            })
        } else {
            toml::from_str(contents).map_err(|e| ConfigError::Toml {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("token_warning_threshold", self.token_warning_threshold),
            ("token_critical_threshold", self.token_critical_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 100, got {value}"
                )));
            }
        }
        if self.token_warning_threshold > self.token_critical_threshold {
            return Err(ConfigError::Invalid(format!(
                "token_warning_threshold ({}) exceeds token_critical_threshold ({})",
                self.token_warning_threshold, self.token_critical_threshold
            )));
        }
        if self.max_restart_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_restart_attempts must be at least 1".to_string(),
            ));
        }
        if self.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "check_interval_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors from loading or validating the monitor config.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Toml { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Json { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.workspace_base_dir, PathBuf::from(".codex/workspaces"));
        assert_eq!(config.check_interval_seconds, 5);
        assert_eq!(config.token_warning_threshold, 80.0);
        assert_eq!(config.token_critical_threshold, 90.0);
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.restart_backoff_seconds, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(
            &path,
            "workspace_base_dir = \"/srv/ws\"\nmax_restart_attempts = 5\n",
        )
        .unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.workspace_base_dir, PathBuf::from("/srv/ws"));
        assert_eq!(config.max_restart_attempts, 5);
        assert_eq!(config.check_interval_seconds, 5);
    }

    #[test]
    fn test_json_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        std::fs::write(
            &path,
            r#"{"workspace_base_dir":"ws","check_interval_seconds":1,"token_warning_threshold":70.0,"token_critical_threshold":95.0,"max_restart_attempts":2,"restart_backoff_seconds":1}"#,
        )
        .unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.check_interval_seconds, 1);
        assert_eq!(config.token_warning_threshold, 70.0);
        assert_eq!(config.token_critical_threshold, 95.0);
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(&path, "check_interval_seconds = [").unwrap();

        let err = MonitorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_threshold_order_validated() {
        let config = MonitorConfig {
            token_warning_threshold: 95.0,
            token_critical_threshold: 90.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds token_critical_threshold"));
    }

    #[test]
    fn test_threshold_range_validated() {
        let config = MonitorConfig {
            token_critical_threshold: 120.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_restart_attempts_rejected() {
        let config = MonitorConfig {
            max_restart_attempts: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_restart_attempts"));
    }
}
