//! Reload Supervisor
//!
//! Keeps the proxy's running configuration in step with the snippet directory:
//!
//! ```text
//! trigger (poll tick | debounced fs event)
//!     → capture snapshot
//!     → compare with watch state
//!     → unchanged: nothing to do
//!     → changed:  commit → validate → reload
//! ```
//!
//! The first snapshot after start-up only establishes the baseline. A failed
//! validation never reaches the reload command, and a failed reload is not
//! retried until the snippet set changes again. None of these failures stop
//! the loop.

use crate::command::{ActionOutcome, CommandAction, ExternalAction};
use crate::config::{Config, ValidationFailurePolicy};
use crate::metrics::Metrics;
use crate::snapshot::{DirectorySource, Snapshot, SnapshotDiff, SnapshotSource};
use crate::trigger::{Trigger, TriggerSource};
use crate::Result;
use anyhow::Context;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// The last committed snapshot, or nothing before the first cycle
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    committed: Option<Snapshot>,
}

/// Result of comparing a fresh snapshot with the watch state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    /// No snapshot committed yet
    Baseline,
    Unchanged,
    Changed(SnapshotDiff),
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Option<&Snapshot> {
        self.committed.as_ref()
    }

    /// Replace the committed snapshot as a whole
    pub fn commit(&mut self, snapshot: Snapshot) {
        self.committed = Some(snapshot);
    }

    pub fn decide(&self, snapshot: &Snapshot) -> ChangeDecision {
        match &self.committed {
            None => ChangeDecision::Baseline,
            Some(committed) => {
                let diff = committed.diff(snapshot);
                if diff.is_empty() {
                    ChangeDecision::Unchanged
                } else {
                    ChangeDecision::Changed(diff)
                }
            }
        }
    }
}

/// What a single cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// First snapshot committed, no reload
    Baseline { snippets: usize },
    Unchanged,
    /// Directory could not be read; watch state untouched
    EnumerationFailed { error: String },
    /// Validator refused the new snippet set; reload skipped
    Rejected { diff: SnapshotDiff },
    Reloaded { diff: SnapshotDiff },
    ReloadFailed { diff: SnapshotDiff },
}

impl CycleOutcome {
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Rejected { .. } | CycleOutcome::Reloaded { .. } | CycleOutcome::ReloadFailed { .. }
        )
    }
}

/// Published to subscribers after every cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub trigger: TriggerSource,
    pub timestamp: SystemTime,
}

/// Watch-validate-reload control loop
pub struct Supervisor<S, V, R> {
    source: S,
    validator: V,
    reloader: R,
    policy: ValidationFailurePolicy,
    state: WatchState,
    /// Last snapshot the validator rejected under the retry policy
    rejected: Option<Snapshot>,
    metrics: Option<Metrics>,
    metrics_file: Option<PathBuf>,
    report_tx: broadcast::Sender<CycleReport>,
}

impl<S, V, R> Supervisor<S, V, R>
where
    S: SnapshotSource,
    V: ExternalAction,
    R: ExternalAction,
{
    pub fn new(source: S, validator: V, reloader: R) -> Self {
        let (report_tx, _) = broadcast::channel(100);

        Self {
            source,
            validator,
            reloader,
            policy: ValidationFailurePolicy::default(),
            state: WatchState::new(),
            rejected: None,
            metrics: None,
            metrics_file: None,
            report_tx,
        }
    }

    pub fn with_policy(mut self, policy: ValidationFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record cycle metrics, optionally exporting them to `metrics_file` after each cycle
    pub fn with_metrics(mut self, metrics: Metrics, metrics_file: Option<PathBuf>) -> Self {
        self.metrics = Some(metrics);
        self.metrics_file = metrics_file;
        self
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Subscribe to cycle reports
    pub fn subscribe(&self) -> BroadcastStream<CycleReport> {
        BroadcastStream::new(self.report_tx.subscribe())
    }

    /// Run one capture-compare-act cycle
    pub async fn cycle(&mut self) -> CycleOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle();
        }

        let snapshot = match self.source.capture() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    stage = "enumerate",
                    directory = %self.source.location().display(),
                    "Failed to read snippet directory, retrying next tick: {:#}",
                    e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_enumeration_failure();
                }
                return CycleOutcome::EnumerationFailed {
                    error: format!("{:#}", e),
                };
            }
        };

        let diff = match self.state.decide(&snapshot) {
            ChangeDecision::Baseline => {
                let snippets = snapshot.len();
                info!(
                    directory = %self.source.location().display(),
                    snippets,
                    "Baseline snapshot established"
                );
                self.commit(snapshot);
                return CycleOutcome::Baseline { snippets };
            }
            ChangeDecision::Unchanged => {
                self.rejected = None;
                return CycleOutcome::Unchanged;
            }
            ChangeDecision::Changed(diff) => diff,
        };

        if self.rejected.as_ref() == Some(&snapshot) {
            debug!(changes = diff.len(), "Revalidating previously rejected snippet set");
        } else {
            self.rejected = None;
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                modified = diff.modified.len(),
                snippets = snapshot.len(),
                "Snippet set changed"
            );
            for path in &diff.added {
                debug!(path = %path.display(), "Snippet added");
            }
            for path in &diff.removed {
                debug!(path = %path.display(), "Snippet removed");
            }
            for path in &diff.modified {
                debug!(path = %path.display(), "Snippet modified");
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_change();
            }
        }

        // Under the retry policy a rejected snapshot must not become the watch state
        let pending = match self.policy {
            ValidationFailurePolicy::Commit => {
                self.commit(snapshot);
                None
            }
            ValidationFailurePolicy::Retry => Some(snapshot),
        };

        let validation = self.validator.run().await;
        if !validation.success {
            error!(
                stage = "validate",
                command = self.validator.name(),
                policy = %self.policy,
                "New snippet set rejected by validator, reload skipped: {}",
                validation.summary()
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_validation_failure();
            }
            self.rejected = pending;
            return CycleOutcome::Rejected { diff };
        }
        log_output(self.validator.name(), &validation);

        if let Some(snapshot) = pending {
            self.rejected = None;
            self.commit(snapshot);
        }

        let reload = self.reloader.run().await;
        if let Some(metrics) = &self.metrics {
            metrics.record_reload(reload.success);
        }

        if reload.success {
            log_output(self.reloader.name(), &reload);
            info!(elapsed = ?reload.elapsed, "Proxy reloaded");
            CycleOutcome::Reloaded { diff }
        } else {
            error!(
                stage = "reload",
                command = self.reloader.name(),
                "Proxy reload failed, waiting for the next snippet change: {}",
                reload.summary()
            );
            CycleOutcome::ReloadFailed { diff }
        }
    }

    /// Loop until `shutdown` fires. An in-flight cycle always runs to completion.
    pub async fn run(mut self, mut trigger: Trigger, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            directory = %self.source.location().display(),
            native_events = trigger.has_native_events(),
            policy = %self.policy,
            "Supervisor started"
        );

        loop {
            let source = tokio::select! {
                source = trigger.next() => source,
                _ = shutdown.recv() => {
                    info!("Supervisor stopping");
                    break;
                }
            };

            debug!(trigger = %source, "Running watch cycle");
            let outcome = self.cycle().await;
            self.export_metrics();

            let report = CycleReport {
                outcome,
                trigger: source,
                timestamp: SystemTime::now(),
            };
            // No subscribers is the normal case outside tests
            let _ = self.report_tx.send(report);
        }

        Ok(())
    }

    fn commit(&mut self, snapshot: Snapshot) {
        if let Some(metrics) = &self.metrics {
            metrics.set_snippet_count(snapshot.len());
        }
        self.state.commit(snapshot);
    }

    fn export_metrics(&self) {
        if let (Some(metrics), Some(path)) = (&self.metrics, &self.metrics_file) {
            if let Err(e) = metrics.write_textfile(path) {
                warn!(path = %path.display(), "Failed to export metrics: {:#}", e);
            }
        }
    }
}

fn log_output(action: &str, outcome: &ActionOutcome) {
    if !outcome.stdout.trim().is_empty() {
        debug!(action, stdout = %outcome.stdout.trim(), "Command output");
    }
    if !outcome.stderr.trim().is_empty() {
        debug!(action, stderr = %outcome.stderr.trim(), "Command output");
    }
}

/// Supervisor wired to the real filesystem and external commands
pub type CommandSupervisor = Supervisor<DirectorySource, CommandAction, CommandAction>;

/// Build a supervisor from configuration.
///
/// Creates the snippet directory if needed; failing to do so is the only fatal error.
pub fn build(config: &Config) -> Result<CommandSupervisor> {
    let mut source = DirectorySource::new(&config.watcher.directory);
    if let Some(pattern) = &config.watcher.include_pattern {
        source = source.with_filter(pattern)?;
    }
    source.ensure_exists()?;

    let validator = CommandAction::new(
        "validate",
        config.commands.validate.clone(),
        config.commands.timeout,
    );
    let reloader = CommandAction::new(
        "reload",
        config.commands.reload.clone(),
        config.commands.timeout,
    );

    if validator.is_noop() {
        warn!("No validate command configured, every snippet change will be reloaded unchecked");
    }
    if reloader.is_noop() {
        warn!("No reload command configured, changes will only be validated");
    }

    let metrics = Metrics::new().context("Failed to create metrics registry")?;

    Ok(Supervisor::new(source, validator, reloader)
        .with_policy(config.watcher.on_validation_failure)
        .with_metrics(metrics, config.monitoring.metrics_file.clone()))
}

/// Build the trigger the configuration asks for
pub fn build_trigger(config: &Config) -> Trigger {
    if config.watcher.use_native_events {
        Trigger::with_native_events(
            &config.watcher.directory,
            config.watcher.poll_interval,
            config.watcher.debounce,
        )
    } else {
        Trigger::polling(config.watcher.poll_interval)
    }
}

/// Watch `config.watcher.directory` until `shutdown` fires
pub async fn run(config: &Config, shutdown: broadcast::Receiver<()>) -> Result<()> {
    let supervisor = build(config)?;
    let trigger = build_trigger(config);
    supervisor.run(trigger, shutdown).await
}
