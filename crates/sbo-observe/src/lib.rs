//! Structured observability for orchestrator operations.
//!
//! Provides [`OperationsMetrics`] — atomic counters for all key
//! operations — and [`MetricsExporter`], which renders them in
//! Prometheus text format for an embedding binary to expose.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

// ─────────────────────────────────────────────────────────────
// Atomic Counter
// ─────────────────────────────────────────────────────────────

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Operations Metrics
// ─────────────────────────────────────────────────────────────

/// Atomic operation counters for the orchestrator's key operations.
///
/// All counters are thread-safe and can be shared via [`Arc`].
///
/// # Example
/// ```rust
/// # use sbo_observe::OperationsMetrics;
/// # use std::sync::Arc;
/// let metrics = Arc::new(OperationsMetrics::new());
/// metrics.creates_total.inc();
/// assert_eq!(metrics.creates_total.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    pub creates_total: Counter,
    pub create_errors: Counter,
    pub deletes_total: Counter,
    pub diagnostics_total: Counter,
    pub diagnostics_rate_limited: Counter,
    pub repairs_attempted: Counter,
    pub repairs_succeeded: Counter,
    pub repairs_rolled_back: Counter,
    pub backups_total: Counter,
    pub backup_errors: Counter,
    pub restores_total: Counter,
    pub restore_errors: Counter,
    pub config_edits_total: Counter,
    pub config_edit_rollbacks: Counter,
}

impl OperationsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create_attempt(&self) {
        self.creates_total.inc();
        info!(counter = "creates_total", value = self.creates_total.get(), "create attempt");
    }

    pub fn record_create_error(&self) {
        self.create_errors.inc();
        warn!(counter = "create_errors", value = self.create_errors.get(), "create failed");
    }

    pub fn record_delete(&self) {
        self.deletes_total.inc();
    }

    pub fn record_diagnostic(&self) {
        self.diagnostics_total.inc();
    }

    pub fn record_diagnostic_rate_limited(&self) {
        self.diagnostics_rate_limited.inc();
    }

    pub fn record_repair_attempt(&self) {
        self.repairs_attempted.inc();
        info!(counter = "repairs_attempted", value = self.repairs_attempted.get(), "repair attempt");
    }

    pub fn record_repair_success(&self) {
        self.repairs_succeeded.inc();
        info!(counter = "repairs_succeeded", value = self.repairs_succeeded.get(), "repair succeeded");
    }

    pub fn record_repair_rollback(&self) {
        self.repairs_rolled_back.inc();
        warn!(counter = "repairs_rolled_back", value = self.repairs_rolled_back.get(), "repair rolled back");
    }

    pub fn record_backup(&self) {
        self.backups_total.inc();
    }

    pub fn record_backup_error(&self) {
        self.backup_errors.inc();
        error!(counter = "backup_errors", value = self.backup_errors.get(), "backup failed");
    }

    pub fn record_restore(&self) {
        self.restores_total.inc();
    }

    pub fn record_restore_error(&self) {
        self.restore_errors.inc();
        error!(counter = "restore_errors", value = self.restore_errors.get(), "restore failed");
    }

    pub fn record_config_edit(&self) {
        self.config_edits_total.inc();
    }

    pub fn record_config_edit_rollback(&self) {
        self.config_edit_rollbacks.inc();
        warn!(
            counter = "config_edit_rollbacks",
            value = self.config_edit_rollbacks.get(),
            "config edit rolled back"
        );
    }
}

// ─────────────────────────────────────────────────────────────
// Metrics Exporter (Prometheus text format)
// ─────────────────────────────────────────────────────────────

/// Exports [`OperationsMetrics`] in Prometheus text format.
pub struct MetricsExporter {
    metrics: Arc<OperationsMetrics>,
    /// Label prefix added to all metric names (default: `supa_orchestrator`).
    prefix: String,
}

impl MetricsExporter {
    pub fn new(metrics: Arc<OperationsMetrics>) -> Self {
        Self { metrics, prefix: "supa_orchestrator".to_string() }
    }

    pub fn with_prefix(metrics: Arc<OperationsMetrics>, prefix: impl Into<String>) -> Self {
        Self { metrics, prefix: prefix.into() }
    }

    /// Render all metrics as a Prometheus text format string.
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let p = &self.prefix;
        let mut out = String::new();

        self.write_counter(&mut out, p, "creates_total", "Total instance create attempts", m.creates_total.get());
        self.write_counter(&mut out, p, "create_errors", "Total failed instance creates", m.create_errors.get());
        self.write_counter(&mut out, p, "deletes_total", "Total instance deletes", m.deletes_total.get());
        self.write_counter(&mut out, p, "diagnostics_total", "Total diagnostic runs", m.diagnostics_total.get());
        self.write_counter(
            &mut out,
            p,
            "diagnostics_rate_limited",
            "Total diagnostic calls rejected by the rate limit",
            m.diagnostics_rate_limited.get(),
        );
        self.write_counter(&mut out, p, "repairs_attempted", "Total auto-repair sequences initiated", m.repairs_attempted.get());
        self.write_counter(&mut out, p, "repairs_succeeded", "Total successful auto-repair sequences", m.repairs_succeeded.get());
        self.write_counter(&mut out, p, "repairs_rolled_back", "Total auto-repairs that rolled back", m.repairs_rolled_back.get());
        self.write_counter(&mut out, p, "backups_total", "Total backup snapshots taken", m.backups_total.get());
        self.write_counter(&mut out, p, "backup_errors", "Total backup snapshot failures", m.backup_errors.get());
        self.write_counter(&mut out, p, "restores_total", "Total restore operations", m.restores_total.get());
        self.write_counter(&mut out, p, "restore_errors", "Total restore failures", m.restore_errors.get());
        self.write_counter(&mut out, p, "config_edits_total", "Total config edits applied", m.config_edits_total.get());
        self.write_counter(
            &mut out,
            p,
            "config_edit_rollbacks",
            "Total config edits rolled back after a failed health check",
            m.config_edit_rollbacks.get(),
        );

        out
    }

    fn write_counter(&self, out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        out.push_str(&format!("{prefix}_{name} {value}\n\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_inc() {
        let c = Counter::default();
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_exporter_renders_all_counters() {
        let metrics = Arc::new(OperationsMetrics::new());
        metrics.record_create_attempt();
        metrics.record_repair_success();

        let exporter = MetricsExporter::new(metrics);
        let rendered = exporter.render();
        assert!(rendered.contains("supa_orchestrator_creates_total 1"));
        assert!(rendered.contains("supa_orchestrator_repairs_succeeded 1"));
    }

    #[test]
    fn test_exporter_custom_prefix() {
        let metrics = Arc::new(OperationsMetrics::new());
        let exporter = MetricsExporter::with_prefix(metrics, "custom");
        assert!(exporter.render().contains("custom_creates_total 0"));
    }
}
