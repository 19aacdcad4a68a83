//! Deterministic in-memory [`RuntimeDriver`] fake for tests.
//!
//! Tracks per-instance container state without touching Docker. Failures
//! can be injected per-instance so repair and rollback paths can be
//! exercised without a host daemon.

use crate::{ContainerStatus, Result, RuntimeDriver, RuntimeError, RuntimeTarget};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct InstanceState {
    running: HashMap<String, bool>,
    up_calls: u32,
    down_calls: u32,
    restart_calls: u32,
}

/// Failure an instance's next matching call should return instead of
/// succeeding. Cleared after it fires once.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Up(String),
    Down(String),
    Restart(String),
    Timeout(Duration),
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, InstanceState>,
    pending_failures: HashMap<String, InjectedFailure>,
}

/// In-memory substitute for a real container runtime. Every instance
/// starts absent; calling `up` marks all of `container_names` running.
#[derive(Clone, Default)]
pub struct InMemoryDriver {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next operation against `instance_id` to fail.
    pub fn inject_failure(&self, instance_id: &str, failure: InjectedFailure) {
        self.inner.lock().pending_failures.insert(instance_id.to_string(), failure);
    }

    fn take_failure(&self, instance_id: &str) -> Option<InjectedFailure> {
        self.inner.lock().pending_failures.remove(instance_id)
    }

    pub fn up_call_count(&self, instance_id: &str) -> u32 {
        self.inner.lock().instances.get(instance_id).map(|s| s.up_calls).unwrap_or(0)
    }

    pub fn restart_call_count(&self, instance_id: &str) -> u32 {
        self.inner.lock().instances.get(instance_id).map(|s| s.restart_calls).unwrap_or(0)
    }

    /// Mark a single container down without going through `stop`/`down`,
    /// for simulating a crashed container ahead of a repair test.
    pub fn set_container_running(&self, instance_id: &str, container_name: &str, running: bool) {
        let mut inner = self.inner.lock();
        let state = inner.instances.entry(instance_id.to_string()).or_default();
        state.running.insert(container_name.to_string(), running);
    }
}

#[async_trait]
impl RuntimeDriver for InMemoryDriver {
    async fn up(&self, target: &RuntimeTarget, _timeout: Duration) -> Result<()> {
        if let Some(InjectedFailure::Up(msg)) = self.take_failure(&target.instance_id) {
            return Err(RuntimeError::Runtime(msg));
        }
        let mut inner = self.inner.lock();
        let state = inner.instances.entry(target.instance_id.clone()).or_default();
        state.up_calls += 1;
        for name in &target.container_names {
            state.running.insert(name.clone(), true);
        }
        Ok(())
    }

    async fn down(&self, target: &RuntimeTarget, _timeout: Duration) -> Result<()> {
        if let Some(InjectedFailure::Down(msg)) = self.take_failure(&target.instance_id) {
            return Err(RuntimeError::Runtime(msg));
        }
        let mut inner = self.inner.lock();
        let state = inner.instances.entry(target.instance_id.clone()).or_default();
        state.down_calls += 1;
        state.running.clear();
        Ok(())
    }

    async fn stop(&self, target: &RuntimeTarget, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.instances.entry(target.instance_id.clone()).or_default();
        for name in &target.container_names {
            state.running.insert(name.clone(), false);
        }
        Ok(())
    }

    async fn start(&self, target: &RuntimeTarget, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.instances.entry(target.instance_id.clone()).or_default();
        for name in &target.container_names {
            state.running.insert(name.clone(), true);
        }
        Ok(())
    }

    async fn restart(&self, container_name: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        for state in inner.instances.values_mut() {
            if let Some(running) = state.running.get_mut(container_name) {
                *running = true;
                state.restart_calls += 1;
            }
        }
        Ok(())
    }

    async fn list(&self, target: &RuntimeTarget, _timeout: Duration) -> Result<Vec<ContainerStatus>> {
        if let Some(InjectedFailure::Timeout(d)) = self.take_failure(&target.instance_id) {
            return Err(RuntimeError::Timeout(d));
        }
        let inner = self.inner.lock();
        let state = inner.instances.get(&target.instance_id);
        let now = Utc::now();
        Ok(target
            .container_names
            .iter()
            .map(|name| {
                let running = state.and_then(|s| s.running.get(name).copied()).unwrap_or(false);
                ContainerStatus {
                    name: name.clone(),
                    exists: state.is_some(),
                    running,
                    status_text: if running { "running".to_string() } else { "stopped".to_string() },
                    created_at: if state.is_some() { Some(now) } else { None },
                    state: if running { "running".to_string() } else { "exited".to_string() },
                }
            })
            .collect())
    }

    async fn logs(&self, container_name: &str, _tail_lines: usize, _timeout: Duration) -> Result<String> {
        Ok(format!("[fake log output for {container_name}]"))
    }
}
