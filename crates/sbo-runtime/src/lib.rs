//! Thin abstraction over the container runtime: up/down/restart/inspect/logs.
//!
//! [`RuntimeDriver`] is a narrow capability trait with one implementation
//! delegating to the Docker Engine API ([`bollard_driver::BollardDriver`])
//! and a deterministic in-memory fake ([`memory_driver::InMemoryDriver`])
//! for tests that never require a host Docker daemon.

#![forbid(unsafe_code)]

pub mod bollard_driver;
pub mod memory_driver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sbo_proto::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use bollard_driver::BollardDriver;
pub use memory_driver::InMemoryDriver;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Runtime
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub exists: bool,
    pub running: bool,
    pub status_text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub state: String,
}

/// Everything the Runtime Driver needs to bring an instance up: rendered
/// compose file path, env file path, and the expected container names.
#[derive(Debug, Clone)]
pub struct RuntimeTarget {
    pub instance_id: String,
    pub compose_file: String,
    pub env_file: String,
    pub container_names: Vec<String>,
}

/// A narrow capability interface over the container runtime. Every
/// operation is bounded by a timeout and blocking from the caller's view.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Start all containers of an instance from its rendered compose and
    /// env files, pulling missing images.
    async fn up(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()>;

    /// Stop and remove containers; leaves volumes on disk untouched.
    async fn down(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()>;

    /// Stop without removal.
    async fn stop(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()>;

    /// Start without recreation.
    async fn start(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()>;

    /// Graceful stop-then-start of a single container.
    async fn restart(&self, container_name: &str, timeout: Duration) -> Result<()>;

    /// Per-expected-container status for an instance.
    async fn list(&self, target: &RuntimeTarget, timeout: Duration) -> Result<Vec<ContainerStatus>>;

    /// Recent log text for a single container.
    async fn logs(&self, container_name: &str, tail_lines: usize, timeout: Duration) -> Result<String>;

    /// Poll `list` until at least 80% of expected containers are running,
    /// or `timeout` elapses.
    async fn wait_healthy(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let statuses = self.list(target, Duration::from_secs(10)).await?;
            let running = statuses.iter().filter(|s| s.running).count();
            let ratio = running as f64 / statuses.len().max(1) as f64;
            if ratio >= 0.8 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_healthy_uses_default_list_threshold() {
        let driver = InMemoryDriver::new();
        let target = RuntimeTarget {
            instance_id: "i1".into(),
            compose_file: String::new(),
            env_file: String::new(),
            container_names: vec!["a".into(), "b".into()],
        };
        driver.up(&target, Duration::from_secs(5)).await.unwrap();
        driver.wait_healthy(&target, Duration::from_secs(1)).await.unwrap();
    }
}
