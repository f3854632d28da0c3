//! snippet-reloader - proxy configuration snippet watcher
//!
//! Polls (and, where available, listens for filesystem events on) a directory
//! of configuration snippets written by a control plane, validates the proxy
//! configuration when the snippet set changes and reloads the proxy.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snippet_reloader::{config::ConfigManager, supervisor, ShutdownCoordinator};

/// CLI arguments for snippet-reloader
#[derive(Parser, Debug)]
#[command(name = "snippet-reloader")]
#[command(about = "Validate and reload a proxy whenever its configuration snippets change")]
#[command(version)]
#[command(long_about = "
Watches a directory of proxy configuration snippets. When files are added,
removed or modified the proxy configuration is validated and, if valid, the
proxy is reloaded. The first scan after start-up only records a baseline.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  NGINX_SNIPPETS_DIR                      - Snippet directory
  SNIPPET_RELOADER_POLL_INTERVAL          - Poll interval (e.g., 2s, 500ms)
  SNIPPET_RELOADER_DEBOUNCE               - Quiet period after filesystem events
  SNIPPET_RELOADER_NATIVE_EVENTS          - Use native filesystem events (true/false)
  SNIPPET_RELOADER_VALIDATE_CMD           - Validate command, empty disables
  SNIPPET_RELOADER_RELOAD_CMD             - Reload command, empty disables
  SNIPPET_RELOADER_COMMAND_TIMEOUT        - Timeout for each command
  SNIPPET_RELOADER_ON_VALIDATION_FAILURE  - commit or retry
  SNIPPET_RELOADER_LOG_LEVEL              - Log level (trace, debug, info, warn, error)
  SNIPPET_RELOADER_METRICS_FILE           - Prometheus textfile output path
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "snippet-reloader.toml")]
    pub config: PathBuf,

    /// Snippet directory (overrides config file)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Poll interval, e.g. 2s or 500ms (overrides config file)
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Validate command run through `sh -c`; empty disables validation
    #[arg(long)]
    pub validate_cmd: Option<String>,

    /// Reload command run through `sh -c`; empty disables reloading
    #[arg(long)]
    pub reload_cmd: Option<String>,

    /// Poll only, never use native filesystem events
    #[arg(long)]
    pub no_native_events: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Configuration priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.dir.as_deref(),
        args.poll_interval,
        args.validate_cmd.as_deref(),
        args.reload_cmd.as_deref(),
        args.no_native_events,
    );
    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config.monitoring.log_level)?;

    info!("Starting snippet-reloader v{}", env!("CARGO_PKG_VERSION"));

    let describe = |spec: &Option<snippet_reloader::command::CommandSpec>| {
        spec.as_ref()
            .filter(|spec| !spec.is_empty())
            .map(|spec| spec.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    };

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Snippet directory: {}", config.watcher.directory.display());
        info!("  Poll interval: {:?}", config.watcher.poll_interval);
        info!("  Native events: {}", config.watcher.use_native_events);
        info!("  Validate command: {}", describe(&config.commands.validate));
        info!("  Reload command: {}", describe(&config.commands.reload));
        info!("  On validation failure: {}", config.watcher.on_validation_failure);
        return Ok(());
    }

    info!(
        directory = %config.watcher.directory.display(),
        poll_interval = ?config.watcher.poll_interval,
        validate = %describe(&config.commands.validate),
        reload = %describe(&config.commands.reload),
        "Configuration loaded"
    );

    let shutdown_coordinator = ShutdownCoordinator::new();
    let shutdown_rx = shutdown_coordinator.subscribe();

    let signal_coordinator = shutdown_coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_coordinator.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    });

    supervisor::run(&config, shutdown_rx).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) -> Result<()> {
    let log_level = if args.verbose { "debug" } else { configured_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
