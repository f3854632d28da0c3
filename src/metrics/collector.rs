//! Metrics Collector

use crate::Result;
use anyhow::Context;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

/// Collects supervisor metrics in a Prometheus registry
pub struct Metrics {
    registry: Registry,

    cycles_total: IntCounter,
    enumeration_failures_total: IntCounter,
    changes_detected_total: IntCounter,
    validation_failures_total: IntCounter,
    reloads_total: IntCounter,
    reload_failures_total: IntCounter,
    snippets: IntGauge,
    last_reload_timestamp: Gauge,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounter::new(
            "snippet_reloader_cycles_total",
            "Total number of watch cycles run",
        )?;
        let enumeration_failures_total = IntCounter::new(
            "snippet_reloader_enumeration_failures_total",
            "Cycles skipped because the snippet directory could not be read",
        )?;
        let changes_detected_total = IntCounter::new(
            "snippet_reloader_changes_detected_total",
            "Cycles that observed a different snippet set",
        )?;
        let validation_failures_total = IntCounter::new(
            "snippet_reloader_validation_failures_total",
            "Snippet sets rejected by the validator",
        )?;
        let reloads_total = IntCounter::new(
            "snippet_reloader_reloads_total",
            "Successful proxy reloads",
        )?;
        let reload_failures_total = IntCounter::new(
            "snippet_reloader_reload_failures_total",
            "Failed proxy reloads",
        )?;
        let snippets = IntGauge::new(
            "snippet_reloader_snippets",
            "Number of snippets in the committed snapshot",
        )?;
        let last_reload_timestamp = Gauge::new(
            "snippet_reloader_last_reload_timestamp_seconds",
            "Unix time of the last successful reload",
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(enumeration_failures_total.clone()))?;
        registry.register(Box::new(changes_detected_total.clone()))?;
        registry.register(Box::new(validation_failures_total.clone()))?;
        registry.register(Box::new(reloads_total.clone()))?;
        registry.register(Box::new(reload_failures_total.clone()))?;
        registry.register(Box::new(snippets.clone()))?;
        registry.register(Box::new(last_reload_timestamp.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            enumeration_failures_total,
            changes_detected_total,
            validation_failures_total,
            reloads_total,
            reload_failures_total,
            snippets,
            last_reload_timestamp,
        })
    }

    pub fn record_cycle(&self) {
        self.cycles_total.inc();
    }

    pub fn record_enumeration_failure(&self) {
        self.enumeration_failures_total.inc();
    }

    pub fn record_change(&self) {
        self.changes_detected_total.inc();
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures_total.inc();
    }

    pub fn record_reload(&self, success: bool) {
        if success {
            self.reloads_total.inc();
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            self.last_reload_timestamp.set(now);
        } else {
            self.reload_failures_total.inc();
        }
    }

    pub fn set_snippet_count(&self, count: usize) {
        self.snippets.set(count as i64);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles_total.get(),
            enumeration_failures: self.enumeration_failures_total.get(),
            changes_detected: self.changes_detected_total.get(),
            validation_failures: self.validation_failures_total.get(),
            reloads: self.reloads_total.get(),
            reload_failures: self.reload_failures_total.get(),
            snippets: self.snippets.get(),
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
    }

    /// Atomically replace `path` with the current exposition
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let body = self.export_prometheus()?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in: {}", dir.display()))?;
        tmp.write_all(body.as_bytes())
            .context("Failed to write metrics")?;
        tmp.as_file().flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to persist metrics to: {}", path.display()))?;
        Ok(())
    }
}

/// Plain copy of the counters, handy for logging and assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub enumeration_failures: u64,
    pub changes_detected: u64,
    pub validation_failures: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub snippets: i64,
}
