//! Cache, rate limit, and history ring over diagnostics produced by the
//! Health Checker.
//!
//! A fresh diagnostic is valid for [`DiagnosticsConfig::cache_ttl`]. A given
//! instance may not be re-probed more often than once per
//! [`DiagnosticsConfig::rate_limit`]; a call inside the window either
//! returns the last cached report, or, if the previous attempt never made
//! it into the cache (still running, or it failed before calling
//! [`DiagnosticEngine::record`]), fails with [`DiagnosticsError::RateLimited`]
//! instead of handing out a second concurrent `Proceed`.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sbo_proto::{Diagnostic, ErrorKind};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("diagnostics for this instance were run less than the rate limit ago")]
    RateLimited,
}

impl DiagnosticsError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Concurrency
    }
}

pub type Result<T> = std::result::Result<T, DiagnosticsError>;

/// Per-instance history ring, bounded at this many entries.
const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsConfig {
    pub cache_ttl: Duration,
    pub rate_limit: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self { cache_ttl: Duration::from_secs(5 * 60), rate_limit: Duration::from_secs(2 * 60) }
    }
}

struct CacheEntry {
    diagnostic: Diagnostic,
    computed_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        age(self.computed_at) < ttl
    }
}

fn age(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}

/// What the caller should do after asking to run a diagnostic.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// Rate limit window has elapsed (or this is the first call); proceed
    /// with a real probe run.
    Proceed,
    /// Still within the rate-limit window; use this instead of re-probing.
    UseCached(Diagnostic),
}

/// In-memory cache + rate limiter + history ring, one per running process.
pub struct DiagnosticEngine {
    cache: RwLock<HashMap<String, CacheEntry>>,
    // Stamped every time `gate` hands out a `Proceed`, independent of
    // whether that probe ever calls back into `record`. Without this, a
    // probe that's slow or fails to complete leaves no cache entry behind,
    // and a second caller inside the rate-limit window would wrongly see
    // a clean `Proceed` too.
    last_attempt: RwLock<HashMap<String, DateTime<Utc>>>,
    history: RwLock<HashMap<String, VecDeque<Diagnostic>>>,
    config: DiagnosticsConfig,
}

impl DiagnosticEngine {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            last_attempt: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Decide whether a fresh `run_full_diagnostic` call should proceed for
    /// `instance_id`, per the rate limit.
    pub fn gate(&self, instance_id: &str) -> Result<GateOutcome> {
        let cache = self.cache.read();
        if let Some(entry) = cache.get(instance_id) {
            if age(entry.computed_at) < self.config.rate_limit {
                return Ok(GateOutcome::UseCached(entry.diagnostic.clone()));
            }
        }
        drop(cache);

        let mut last_attempt = self.last_attempt.write();
        if let Some(attempted_at) = last_attempt.get(instance_id) {
            if age(*attempted_at) < self.config.rate_limit {
                return Err(DiagnosticsError::RateLimited);
            }
        }
        last_attempt.insert(instance_id.to_string(), Utc::now());
        Ok(GateOutcome::Proceed)
    }

    /// Record a freshly computed diagnostic: refreshes the cache entry and
    /// appends to the instance's history ring.
    pub fn record(&self, diagnostic: Diagnostic) {
        let instance_id = diagnostic.instance_id.clone();
        let computed_at = diagnostic.timestamp;

        self.cache.write().insert(instance_id.clone(), CacheEntry { diagnostic: diagnostic.clone(), computed_at });

        let mut history = self.history.write();
        let ring = history.entry(instance_id).or_default();
        if ring.len() == HISTORY_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(diagnostic);
    }

    /// The cached entry for `instance_id` if still within the TTL, otherwise
    /// `None` (and the stale entry is dropped).
    pub fn get_last(&self, instance_id: &str) -> Option<Diagnostic> {
        let mut cache = self.cache.write();
        match cache.get(instance_id) {
            Some(entry) if entry.is_fresh(self.config.cache_ttl) => Some(entry.diagnostic.clone()),
            Some(_) => {
                cache.remove(instance_id);
                None
            }
            None => None,
        }
    }

    /// Up to the last 100 diagnostics recorded for `instance_id`, oldest first.
    pub fn history(&self, instance_id: &str) -> Vec<Diagnostic> {
        self.history.read().get(instance_id).map(|ring| ring.iter().cloned().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbo_proto::ProbeOutcome;
    use std::collections::HashMap as StdHashMap;

    fn make_diagnostic(instance_id: &str, healthy: bool) -> Diagnostic {
        Diagnostic {
            timestamp: Utc::now(),
            instance_id: instance_id.to_string(),
            overall_healthy: healthy,
            results: StdHashMap::new(),
            critical_issues: vec![],
            recent_logs: String::new(),
        }
    }

    #[test]
    fn test_gate_proceeds_when_nothing_recorded() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        assert!(matches!(engine.gate("i1").unwrap(), GateOutcome::Proceed));
    }

    #[test]
    fn test_gate_rate_limits_repeat_calls_before_anything_is_recorded() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig {
            cache_ttl: Duration::from_secs(300),
            rate_limit: Duration::from_secs(120),
        });
        assert!(matches!(engine.gate("i1").unwrap(), GateOutcome::Proceed));

        // The first probe never called `record` (still running, or it
        // failed outright), so there's nothing to serve from cache — but
        // a second call still inside the rate-limit window must not get
        // a clean `Proceed` either.
        let err = engine.gate("i1").unwrap_err();
        assert!(matches!(err, DiagnosticsError::RateLimited));
    }

    #[test]
    fn test_gate_returns_cached_within_rate_limit() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig {
            cache_ttl: Duration::from_secs(300),
            rate_limit: Duration::from_secs(120),
        });
        engine.record(make_diagnostic("i1", true));
        match engine.gate("i1").unwrap() {
            GateOutcome::UseCached(d) => assert_eq!(d.instance_id, "i1"),
            GateOutcome::Proceed => panic!("expected cached hit within rate limit window"),
        }
    }

    #[test]
    fn test_get_last_fresh_within_ttl() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        engine.record(make_diagnostic("i1", true));
        assert!(engine.get_last("i1").is_some());
    }

    #[test]
    fn test_get_last_absent_when_never_recorded() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        assert!(engine.get_last("unknown").is_none());
    }

    #[test]
    fn test_get_last_expires_past_ttl() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig { cache_ttl: Duration::ZERO, rate_limit: Duration::from_secs(120) });
        engine.record(make_diagnostic("i1", true));
        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.get_last("i1").is_none());
    }

    #[test]
    fn test_history_bounded_at_capacity() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        for _ in 0..(HISTORY_CAPACITY + 10) {
            engine.record(make_diagnostic("i1", true));
        }
        assert_eq!(engine.history("i1").len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_history_empty_for_unknown_instance() {
        let engine = DiagnosticEngine::new(DiagnosticsConfig::default());
        assert!(engine.history("unknown").is_empty());
    }
}
