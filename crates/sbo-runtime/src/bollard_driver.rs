//! Docker Engine API-backed [`RuntimeDriver`].
//!
//! Per-container operations (restart, inspect, logs, stop, remove) go
//! through `bollard` directly. Compose bring-up/teardown shells out to the
//! `docker compose` CLI, which bollard's low-level container API has no
//! equivalent for.

use crate::{ContainerStatus, Result, RuntimeDriver, RuntimeError, RuntimeTarget};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::RestartContainerOptions;
use bollard::query_parameters::{InspectContainerOptions, LogsOptionsBuilder};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{instrument, warn};

pub struct BollardDriver {
    docker: Docker,
}

impl BollardDriver {
    /// Connect to the Docker daemon via the given socket path, falling
    /// back to the platform default when empty.
    pub fn connect(socket_path: &str) -> Result<Self> {
        let docker = if socket_path.is_empty() {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(Self { docker })
    }

    async fn inspect_one(&self, name: &str) -> ContainerStatus {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info.state.clone().unwrap_or_default();
                let running = state.running.unwrap_or(false);
                let status_text = state
                    .status
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|| "unknown".to_string());
                let created_at = info
                    .created
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc));

                ContainerStatus {
                    name: name.to_string(),
                    exists: true,
                    running,
                    status_text,
                    created_at,
                    state: format!("{:?}", state.status),
                }
            }
            Err(_) => ContainerStatus {
                name: name.to_string(),
                exists: false,
                running: false,
                status_text: "absent".to_string(),
                created_at: None,
                state: "absent".to_string(),
            },
        }
    }

    async fn run_compose(&self, args: &[&str], timeout: Duration) -> Result<()> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("compose").args(args);

        let run = cmd.output();
        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| RuntimeError::Runtime(e.to_string()))?;

        if !output.status.success() {
            return Err(RuntimeError::Runtime(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeDriver for BollardDriver {
    #[instrument(skip(self, target))]
    async fn up(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()> {
        self.run_compose(
            &["-f", &target.compose_file, "--env-file", &target.env_file, "up", "-d", "--pull", "missing"],
            timeout,
        )
        .await
    }

    #[instrument(skip(self, target))]
    async fn down(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()> {
        self.run_compose(&["-f", &target.compose_file, "--env-file", &target.env_file, "down"], timeout).await
    }

    #[instrument(skip(self, target))]
    async fn stop(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()> {
        self.run_compose(&["-f", &target.compose_file, "--env-file", &target.env_file, "stop"], timeout).await
    }

    #[instrument(skip(self, target))]
    async fn start(&self, target: &RuntimeTarget, timeout: Duration) -> Result<()> {
        self.run_compose(&["-f", &target.compose_file, "--env-file", &target.env_file, "start"], timeout).await
    }

    #[instrument(skip(self))]
    async fn restart(&self, container_name: &str, timeout: Duration) -> Result<()> {
        let opts = RestartContainerOptions { t: Some(timeout.as_secs() as i32) };
        tokio::time::timeout(timeout, self.docker.restart_container(container_name, Some(opts)))
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| RuntimeError::Runtime(e.to_string()))
    }

    #[instrument(skip(self, target))]
    async fn list(&self, target: &RuntimeTarget, timeout: Duration) -> Result<Vec<ContainerStatus>> {
        let fut = async {
            let mut out = Vec::with_capacity(target.container_names.len());
            for name in &target.container_names {
                out.push(self.inspect_one(name).await);
            }
            out
        };
        tokio::time::timeout(timeout, fut).await.map_err(|_| RuntimeError::Timeout(timeout))
    }

    #[instrument(skip(self))]
    async fn logs(&self, container_name: &str, tail_lines: usize, timeout: Duration) -> Result<String> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&tail_lines.to_string())
            .build();

        let fut = async {
            let mut stream = self.docker.logs(container_name, Some(options));
            let mut out = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => out.push_str(&log.to_string()),
                    Err(e) => {
                        warn!(container = container_name, error = %e, "error reading log stream");
                        break;
                    }
                }
            }
            out
        };

        tokio::time::timeout(timeout, fut).await.map_err(|_| RuntimeError::Timeout(timeout))
    }
}
