//! Instance lifecycle: a durable [`registry::Registry`] behind a global
//! create-lock and per-instance locks, plus the Safe Config Editor.
//!
//! Mirrors the teacher's `SharedState` shape (shared state behind
//! `Arc<RwLock<_>>`, async read/write accessors) but adds the extra
//! concurrency discipline a multi-tenant registry needs that a
//! single-node view doesn't: at most one create in flight globally, and
//! mutating operations against the same instance serialize against each
//! other while readers never block on either lock.

#![forbid(unsafe_code)]

pub mod config_editor;
pub mod registry;

pub use registry::Registry;

use chrono::Utc;
use sbo_oplog::{OperationAction, OperationLog, OperationResult};
use sbo_proto::{Credentials, DockerPaths, ErrorKind, Instance, InstanceStatus, InstanceUrls};
use sbo_runtime::{RuntimeDriver, RuntimeTarget};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("invalid instance name: {0}")]
    InvalidName(String),
    #[error("instance capacity reached ({max} max)")]
    CapacityExceeded { max: usize },
    #[error("a create operation is already in progress")]
    CreateInProgress,
    #[error(transparent)]
    Allocator(#[from] sbo_allocator::AllocatorError),
    #[error(transparent)]
    Render(#[from] sbo_render::RenderError),
    #[error(transparent)]
    Runtime(#[from] sbo_runtime::RuntimeError),
    #[error(transparent)]
    Backup(#[from] sbo_backup::BackupError),
    #[error("instance failed post-create health checks: {0}")]
    ProvisioningFailed(String),
    #[error("lifecycle filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::InvalidName(_) => ErrorKind::Validation,
            Self::CapacityExceeded { .. } => ErrorKind::Capacity,
            Self::CreateInProgress => ErrorKind::Concurrency,
            Self::Allocator(e) => e.kind(),
            Self::Render(e) => e.kind(),
            Self::Runtime(e) => e.kind(),
            Self::Backup(e) => e.kind(),
            Self::ProvisioningFailed(_) => ErrorKind::Runtime,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

fn target_for(instance: &Instance) -> RuntimeTarget {
    RuntimeTarget {
        instance_id: instance.id.clone(),
        compose_file: instance.docker.compose_file.clone(),
        env_file: instance.docker.env_file.clone(),
        container_names: sbo_proto::EXPECTED_CONTAINERS
            .iter()
            .map(|role| sbo_proto::container_name(&instance.id, role))
            .collect(),
    }
}

/// Owns the instance registry and every lock that guards mutating access
/// to it. Readers (`list_instances`, `get_instance`, `logs`) never take
/// the create-lock or an instance-lock; they only take the registry's
/// own read lock.
pub struct LifecycleController {
    data_root: PathBuf,
    external_host: String,
    templates: sbo_render::TemplateSet,
    driver: Arc<dyn RuntimeDriver>,
    registry: RwLock<Registry>,
    oplog: AsyncMutex<OperationLog>,
    create_lock: AsyncMutex<()>,
    instance_locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    max_instances: usize,
    create_timeout: Duration,
    probe_timeouts: sbo_health::ProbeTimeouts,
}

impl LifecycleController {
    pub fn new(
        data_root: PathBuf,
        external_host: String,
        template_root: &Path,
        driver: Arc<dyn RuntimeDriver>,
        max_instances: usize,
        create_timeout: Duration,
    ) -> Self {
        let registry = Registry::new(&data_root);
        let oplog = OperationLog::new(&data_root);
        Self {
            templates: sbo_render::TemplateSet::new(template_root),
            external_host,
            driver,
            registry: RwLock::new(registry),
            oplog: AsyncMutex::new(oplog),
            create_lock: AsyncMutex::new(()),
            instance_locks: parking_lot::Mutex::new(HashMap::new()),
            max_instances,
            create_timeout,
            probe_timeouts: sbo_health::ProbeTimeouts::default(),
            data_root,
        }
    }

    /// The per-instance serialization lock, created on first use. Exposed
    /// so callers outside this module (the repair engine, the config
    /// editor, the HTTP surface) can hold it across a multi-step mutating
    /// operation instead of re-entering the controller for each step.
    pub fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.instance_locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn log_op(&self, action: OperationAction, instance_id: &str, parameters: serde_json::Value, success: bool, message: &str) {
        self.oplog.lock().await.append(action, instance_id, parameters, OperationResult {
            success,
            message: message.to_string(),
            details: None,
        });
    }

    pub async fn get_instance(&self, id: &str) -> Option<Instance> {
        self.registry.read().await.get(id).cloned()
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        self.registry.read().await.list().into_iter().cloned().collect()
    }

    pub async fn logs(&self, id: &str, container_role: &str, tail_lines: usize) -> Result<String> {
        let instance = self.get_instance(id).await.ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let container = sbo_proto::container_name(&instance.id, container_role);
        Ok(self.driver.logs(&container, tail_lines, Duration::from_secs(10)).await?)
    }

    /// Allocate, render, and bring up a brand-new instance. At most one
    /// call to this method runs at a time across the whole controller;
    /// a second concurrent call fails fast with [`LifecycleError::CreateInProgress`]
    /// instead of queuing behind the first.
    #[instrument(skip(self), fields(project_name))]
    pub async fn create_instance(&self, project_name: &str, organization: Option<String>) -> Result<Instance> {
        if !sbo_proto::validate_instance_name(project_name) {
            return Err(LifecycleError::InvalidName(project_name.to_string()));
        }

        let _create_guard = self.create_lock.try_lock().map_err(|_| LifecycleError::CreateInProgress)?;

        let (existing_ids, used_ports, current_count) = {
            let registry = self.registry.read().await;
            (registry.existing_ids(), registry.used_ports(), registry.len())
        };
        if current_count >= self.max_instances {
            return Err(LifecycleError::CapacityExceeded { max: self.max_instances });
        }

        let id = sbo_allocator::allocate_instance_id(&existing_ids)?;
        let ports = sbo_allocator::allocate_port_set(&used_ports)?;

        let signing_secret = sbo_allocator::generate_signing_secret();
        let credentials = Credentials {
            database_password: sbo_allocator::generate_database_password(),
            anon_key: sbo_allocator::derive_api_token(&signing_secret, sbo_allocator::TokenRole::Anon),
            service_role_key: sbo_allocator::derive_api_token(&signing_secret, sbo_allocator::TokenRole::ServiceRole),
            dashboard_username: sbo_allocator::generate_dashboard_username(),
            dashboard_password: sbo_allocator::generate_dashboard_password(),
            signing_secret,
        };

        let now = Utc::now();
        let mut instance = Instance {
            id: id.clone(),
            name: project_name.to_string(),
            organization: organization.unwrap_or_else(|| "default".to_string()),
            created_at: now,
            updated_at: now,
            status: InstanceStatus::Creating,
            ports,
            credentials,
            docker: DockerPaths { compose_file: String::new(), env_file: String::new(), volumes_dir: String::new() },
            urls: InstanceUrls::derive(&self.external_host, ports.gateway_http),
            last_repair: None,
            last_diagnostic_at: None,
        };

        self.log_op(OperationAction::CreateInstance, &id, json!({"project_name": project_name}), true, "create started").await;

        let rendered = match sbo_render::render_instance(&self.templates, &instance, &self.external_host, &self.data_root) {
            Ok(r) => r,
            Err(e) => {
                self.log_op(OperationAction::CreateInstance, &id, json!({}), false, &e.to_string()).await;
                return Err(LifecycleError::Render(e));
            }
        };
        instance.docker = DockerPaths {
            compose_file: rendered.compose_file.display().to_string(),
            env_file: rendered.env_file.display().to_string(),
            volumes_dir: rendered.volumes_dir.display().to_string(),
        };

        let target = target_for(&instance);

        if let Err(e) = self.driver.up(&target, self.create_timeout).await {
            warn!(instance_id = %id, error = %e, "up failed during create, tearing down");
            let _ = sbo_render::remove_rendered(&self.data_root, &id);
            self.log_op(OperationAction::CreateInstance, &id, json!({}), false, &e.to_string()).await;
            return Err(LifecycleError::Runtime(e));
        }

        // Gate on container-level health only: the database and HTTP
        // services often take longer than `create_timeout` to start
        // accepting connections after their containers report running, so
        // a full `quick_health_check` here would reject instances that are
        // merely still warming up. Those probes still run on the first
        // diagnostic request once the instance is live.
        if self.driver.wait_healthy(&target, self.create_timeout).await.is_err() {
            warn!(instance_id = %id, "instance failed post-create health checks, tearing down");
            let _ = self.driver.down(&target, self.create_timeout).await;
            let _ = sbo_render::remove_rendered(&self.data_root, &id);
            self.log_op(OperationAction::CreateInstance, &id, json!({}), false, "failed post-create health checks").await;
            return Err(LifecycleError::ProvisioningFailed(id));
        }

        instance.status = InstanceStatus::Running;
        instance.updated_at = Utc::now();

        self.registry.write().await.upsert(instance.clone());
        self.log_op(OperationAction::CreateInstance, &instance.id, json!({}), true, "created").await;

        info!(instance_id = %instance.id, "instance created");
        Ok(instance)
    }

    pub async fn start_instance(&self, id: &str) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.get_instance(id).await.ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let target = target_for(&instance);

        self.driver.start(&target, self.create_timeout).await?;
        let _ = self.driver.wait_healthy(&target, self.create_timeout).await;

        instance.status = InstanceStatus::Running;
        instance.updated_at = Utc::now();
        self.registry.write().await.upsert(instance.clone());
        self.log_op(OperationAction::StartInstance, id, json!({}), true, "started").await;
        Ok(instance)
    }

    pub async fn stop_instance(&self, id: &str) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.get_instance(id).await.ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let target = target_for(&instance);

        self.driver.stop(&target, self.create_timeout).await?;

        instance.status = InstanceStatus::Stopped;
        instance.updated_at = Utc::now();
        self.registry.write().await.upsert(instance.clone());
        self.log_op(OperationAction::StopInstance, id, json!({}), true, "stopped").await;
        Ok(instance)
    }

    /// Stop (best-effort) and remove an instance's containers, rendered
    /// artifacts, and registry record. Idempotent once the registry
    /// record is gone.
    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let instance = self.get_instance(id).await.ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let target = target_for(&instance);

        if let Err(e) = self.driver.down(&target, self.create_timeout).await {
            warn!(instance_id = %id, error = %e, "best-effort teardown failed, continuing with delete");
        }
        sbo_render::remove_rendered(&self.data_root, id)?;
        self.registry.write().await.remove(id);
        self.instance_locks.lock().remove(id);

        self.log_op(OperationAction::DeleteInstance, id, json!({}), true, "deleted").await;
        Ok(())
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn probe_timeouts(&self) -> &sbo_health::ProbeTimeouts {
        &self.probe_timeouts
    }

    pub fn driver(&self) -> &Arc<dyn RuntimeDriver> {
        &self.driver
    }

    /// Persist a record that was already mutated by a caller holding the
    /// per-instance lock (e.g. the repair engine or the config editor).
    pub async fn record_instance(&self, instance: Instance) {
        self.registry.write().await.upsert(instance);
    }

    pub async fn log_operation(&self, action: OperationAction, instance_id: &str, parameters: serde_json::Value, result: OperationResult) {
        self.oplog.lock().await.append(action, instance_id, parameters, result);
    }
}
