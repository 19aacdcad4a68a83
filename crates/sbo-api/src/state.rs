use chrono::{DateTime, Utc};
use sbo_diagnostics::DiagnosticEngine;
use sbo_lifecycle::LifecycleController;
use sbo_observe::OperationsMetrics;
use std::sync::Arc;

/// Shared state every handler receives through axum's `State` extractor.
/// A thin bundle over the components the router translates requests into —
/// it owns no domain logic itself.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleController>,
    pub diagnostics: Arc<DiagnosticEngine>,
    pub metrics: Arc<OperationsMetrics>,
    pub backup_retention: usize,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        diagnostics: Arc<DiagnosticEngine>,
        metrics: Arc<OperationsMetrics>,
        backup_retention: usize,
    ) -> Self {
        Self { lifecycle, diagnostics, metrics, backup_retention, started_at: Utc::now() }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
