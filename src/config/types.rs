//! Configuration Types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::command::CommandSpec;

/// Default snippet directory shared with the control plane
pub const DEFAULT_SNIPPETS_DIR: &str = "/shared/nginx/routers";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub commands: CommandsConfig,
    pub monitoring: MonitoringConfig,
}

/// Snippet directory watching configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub directory: PathBuf,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    pub use_native_events: bool,
    /// Regex matched against file names; unmatched files are not part of a snapshot
    pub include_pattern: Option<String>,
    pub on_validation_failure: ValidationFailurePolicy,
}

/// What to do with the watch state when the validator rejects a new snippet set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationFailurePolicy {
    /// Commit the rejected snapshot; it is only re-validated once it changes again.
    #[default]
    Commit,
    /// Keep the previous snapshot so the rejected set is re-validated every tick.
    Retry,
}

impl std::str::FromStr for ValidationFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit" => Ok(Self::Commit),
            "retry" => Ok(Self::Retry),
            other => anyhow::bail!("unknown validation failure policy '{}', expected 'commit' or 'retry'", other),
        }
    }
}

impl std::fmt::Display for ValidationFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// External validator and reload commands
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Absent means validation always succeeds
    pub validate: Option<CommandSpec>,
    /// Absent means reload always succeeds
    pub reload: Option<CommandSpec>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Prometheus text exposition written after every cycle
    pub metrics_file: Option<PathBuf>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_SNIPPETS_DIR),
            poll_interval: Duration::from_secs(2),
            debounce: Duration::from_millis(250),
            use_native_events: true,
            include_pattern: None,
            on_validation_failure: ValidationFailurePolicy::Commit,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            validate: Some(CommandSpec::Argv(vec!["nginx".to_string(), "-t".to_string()])),
            reload: Some(CommandSpec::Argv(vec![
                "nginx".to_string(),
                "-s".to_string(),
                "reload".to_string(),
            ])),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_file: None,
        }
    }
}
