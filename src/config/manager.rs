//! Configuration Manager

use super::{Config, ValidationFailurePolicy};
use crate::command::CommandSpec;
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables recognised by [`ConfigManager::apply_env`]
pub const ENV_SNIPPETS_DIR: &str = "NGINX_SNIPPETS_DIR";
pub const ENV_POLL_INTERVAL: &str = "SNIPPET_RELOADER_POLL_INTERVAL";
pub const ENV_DEBOUNCE: &str = "SNIPPET_RELOADER_DEBOUNCE";
pub const ENV_NATIVE_EVENTS: &str = "SNIPPET_RELOADER_NATIVE_EVENTS";
pub const ENV_VALIDATE_CMD: &str = "SNIPPET_RELOADER_VALIDATE_CMD";
pub const ENV_RELOAD_CMD: &str = "SNIPPET_RELOADER_RELOAD_CMD";
pub const ENV_COMMAND_TIMEOUT: &str = "SNIPPET_RELOADER_COMMAND_TIMEOUT";
pub const ENV_ON_VALIDATION_FAILURE: &str = "SNIPPET_RELOADER_ON_VALIDATION_FAILURE";
pub const ENV_LOG_LEVEL: &str = "SNIPPET_RELOADER_LOG_LEVEL";
pub const ENV_METRICS_FILE: &str = "SNIPPET_RELOADER_METRICS_FILE";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults if it does not exist
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables on top of defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override `config` with whatever `lookup` returns for the known variables.
    ///
    /// The lookup is injected so tests do not have to mutate the process environment.
    pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_SNIPPETS_DIR) {
            let trimmed = dir.trim_end_matches('/');
            config.watcher.directory = if trimmed.is_empty() {
                PathBuf::from("/")
            } else {
                PathBuf::from(trimmed)
            };
        }

        if let Some(interval) = lookup(ENV_POLL_INTERVAL) {
            config.watcher.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid {}: {}", ENV_POLL_INTERVAL, interval))?;
        }

        if let Some(debounce) = lookup(ENV_DEBOUNCE) {
            config.watcher.debounce = humantime::parse_duration(&debounce)
                .with_context(|| format!("Invalid {}: {}", ENV_DEBOUNCE, debounce))?;
        }

        if let Some(native) = lookup(ENV_NATIVE_EVENTS) {
            config.watcher.use_native_events = native
                .parse::<bool>()
                .with_context(|| format!("Invalid {}: {}", ENV_NATIVE_EVENTS, native))?;
        }

        if let Some(cmd) = lookup(ENV_VALIDATE_CMD) {
            config.commands.validate = parse_command_env(&cmd);
        }

        if let Some(cmd) = lookup(ENV_RELOAD_CMD) {
            config.commands.reload = parse_command_env(&cmd);
        }

        if let Some(timeout) = lookup(ENV_COMMAND_TIMEOUT) {
            config.commands.timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}: {}", ENV_COMMAND_TIMEOUT, timeout))?;
        }

        if let Some(policy) = lookup(ENV_ON_VALIDATION_FAILURE) {
            config.watcher.on_validation_failure = policy
                .parse::<ValidationFailurePolicy>()
                .with_context(|| format!("Invalid {}", ENV_ON_VALIDATION_FAILURE))?;
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            config.monitoring.log_level = level;
        }

        if let Some(path) = lookup(ENV_METRICS_FILE) {
            config.monitoring.metrics_file = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        Ok(())
    }
}

/// An empty value disables the command; anything else runs through the shell.
fn parse_command_env(value: &str) -> Option<CommandSpec> {
    if value.trim().is_empty() {
        None
    } else {
        Some(CommandSpec::Shell(value.to_string()))
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_watcher_config()
            .with_context(|| "Watcher configuration validation failed")?;

        self.validate_commands_config()
            .with_context(|| "Commands configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_watcher_config(&self) -> Result<()> {
        if self.watcher.directory.as_os_str().is_empty() {
            bail!("watcher.directory must not be empty");
        }

        if self.watcher.poll_interval.is_zero() {
            bail!("watcher.poll_interval must be greater than 0");
        }

        if let Some(pattern) = &self.watcher.include_pattern {
            regex::Regex::new(pattern)
                .with_context(|| format!("watcher.include_pattern is not a valid regex: {}", pattern))?;
        }

        Ok(())
    }

    fn validate_commands_config(&self) -> Result<()> {
        if self.commands.timeout.is_zero() {
            bail!("commands.timeout must be greater than 0");
        }

        for (name, spec) in [
            ("validate", &self.commands.validate),
            ("reload", &self.commands.reload),
        ] {
            if let Some(CommandSpec::Argv(argv)) = spec {
                if argv.first().is_some_and(|program| program.is_empty()) {
                    bail!("commands.{} program name must not be empty", name);
                }
            }
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        // The textfile is rewritten every cycle, so inside the watched
        // directory it would count as a snippet change on the next one
        if let Some(metrics_file) = &self.monitoring.metrics_file {
            if metrics_file.parent() == Some(self.watcher.directory.as_path()) && self.captures(metrics_file) {
                bail!(
                    "monitoring.metrics_file ({}) must not be inside watcher.directory",
                    metrics_file.display()
                );
            }
        }

        Ok(())
    }

    /// Whether the include filter would let `path` into a snapshot
    fn captures(&self, path: &Path) -> bool {
        let Some(pattern) = &self.watcher.include_pattern else {
            return true;
        };
        let Some(name) = path.file_name() else {
            return false;
        };
        // An invalid pattern is reported by the watcher section
        regex::Regex::new(pattern).map_or(true, |re| re.is_match(&name.to_string_lossy()))
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        dir: Option<&Path>,
        poll_interval: Option<Duration>,
        validate_cmd: Option<&str>,
        reload_cmd: Option<&str>,
        no_native_events: bool,
    ) {
        if let Some(dir) = dir {
            self.watcher.directory = dir.to_path_buf();
            tracing::info!("CLI override: snippet directory set to {}", dir.display());
        }

        if let Some(interval) = poll_interval {
            self.watcher.poll_interval = interval;
            tracing::info!("CLI override: poll interval set to {:?}", interval);
        }

        if let Some(cmd) = validate_cmd {
            self.commands.validate = parse_command_env(cmd);
            tracing::info!("CLI override: validate command set to {:?}", cmd);
        }

        if let Some(cmd) = reload_cmd {
            self.commands.reload = parse_command_env(cmd);
            tracing::info!("CLI override: reload command set to {:?}", cmd);
        }

        if no_native_events {
            self.watcher.use_native_events = false;
            tracing::info!("CLI override: native filesystem events disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.watcher.directory, PathBuf::from("/shared/nginx/routers"));
        assert_eq!(config.watcher.on_validation_failure, ValidationFailurePolicy::Commit);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("snippet-reloader.toml");

        let content = r#"
[watcher]
directory = "/etc/nginx/routers"
poll_interval = "5s"
debounce = "100ms"
use_native_events = false
include_pattern = '\.conf$'
on_validation_failure = "retry"

[commands]
validate = "nginx -t -q"
reload = ["nginx", "-s", "reload"]
timeout = "10s"

[monitoring]
log_level = "debug"
"#;
        std::fs::write(&config_path, content).unwrap();

        let config = ConfigManager::load_from_file(&config_path).unwrap();
        assert_eq!(config.watcher.directory, PathBuf::from("/etc/nginx/routers"));
        assert_eq!(config.watcher.poll_interval, Duration::from_secs(5));
        assert_eq!(config.watcher.debounce, Duration::from_millis(100));
        assert!(!config.watcher.use_native_events);
        assert_eq!(config.watcher.include_pattern.as_deref(), Some(r"\.conf$"));
        assert_eq!(config.watcher.on_validation_failure, ValidationFailurePolicy::Retry);
        assert_eq!(
            config.commands.validate,
            Some(CommandSpec::Shell("nginx -t -q".to_string()))
        );
        assert_eq!(
            config.commands.reload,
            Some(CommandSpec::Argv(vec![
                "nginx".to_string(),
                "-s".to_string(),
                "reload".to_string()
            ]))
        );
        assert_eq!(config.commands.timeout, Duration::from_secs(10));
        assert_eq!(config.monitoring.log_level, "debug");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigManager::load_from_file(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.watcher.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        std::fs::write(&config_path, "[watcher]\npoll_interval = \"0s\"\n").unwrap();

        let err = ConfigManager::load_from_file(&config_path).unwrap_err();
        assert!(format!("{:#}", err).contains("poll_interval"));
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = Config::default();
        let lookup = lookup_from(&[
            (ENV_SNIPPETS_DIR, "/tmp/routers/"),
            (ENV_POLL_INTERVAL, "500ms"),
            (ENV_NATIVE_EVENTS, "false"),
            (ENV_VALIDATE_CMD, ""),
            (ENV_RELOAD_CMD, "kill -HUP 1"),
            (ENV_ON_VALIDATION_FAILURE, "Retry"),
            (ENV_LOG_LEVEL, "warn"),
            (ENV_METRICS_FILE, "/tmp/reloader.prom"),
        ]);

        ConfigManager::apply_env(&mut config, lookup).unwrap();

        assert_eq!(config.watcher.directory, PathBuf::from("/tmp/routers"));
        assert_eq!(config.watcher.poll_interval, Duration::from_millis(500));
        assert!(!config.watcher.use_native_events);
        assert_eq!(config.commands.validate, None);
        assert_eq!(
            config.commands.reload,
            Some(CommandSpec::Shell("kill -HUP 1".to_string()))
        );
        assert_eq!(config.watcher.on_validation_failure, ValidationFailurePolicy::Retry);
        assert_eq!(config.monitoring.log_level, "warn");
        assert_eq!(
            config.monitoring.metrics_file,
            Some(PathBuf::from("/tmp/reloader.prom"))
        );
    }

    #[test]
    fn test_apply_env_rejects_bad_duration() {
        let mut config = Config::default();
        let lookup = lookup_from(&[(ENV_POLL_INTERVAL, "soon")]);
        assert!(ConfigManager::apply_env(&mut config, lookup).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.watcher.include_pattern = Some("(".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.commands.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitoring.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.commands.reload = Some(CommandSpec::Argv(vec![String::new(), "-s".to_string()]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_with_cli_args() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some(Path::new("/srv/snippets")),
            Some(Duration::from_secs(1)),
            Some(""),
            Some("nginx -s reload"),
            true,
        );

        assert_eq!(config.watcher.directory, PathBuf::from("/srv/snippets"));
        assert_eq!(config.watcher.poll_interval, Duration::from_secs(1));
        assert_eq!(config.commands.validate, None);
        assert!(config.commands.reload.is_some());
        assert!(!config.watcher.use_native_events);
    }

    #[test]
    fn test_short_poll_interval_from_cli_is_valid() {
        // Default debounce is 250ms, longer than the overridden interval
        let mut config = Config::default();
        config.merge_with_cli_args(None, Some(Duration::from_millis(100)), None, None, true);
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.merge_with_cli_args(None, Some(Duration::from_millis(100)), None, None, false);
        assert!(config.watcher.use_native_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metrics_file_inside_watched_directory_is_rejected() {
        let mut config = Config::default();
        config.watcher.directory = PathBuf::from("/srv/routers/");
        config.monitoring.metrics_file = Some(PathBuf::from("/srv/routers/reloader.prom"));
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("metrics_file"));

        // Excluded by the include filter, so never part of a snapshot
        config.watcher.include_pattern = Some(r"\.conf$".to_string());
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.watcher.directory = PathBuf::from("/srv/routers");
        config.monitoring.metrics_file = Some(PathBuf::from("/srv/reloader.prom"));
        assert!(config.validate().is_ok());
    }
}
