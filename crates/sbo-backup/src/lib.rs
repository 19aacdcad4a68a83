//! Snapshot, verify, cleanup, and restore of per-instance on-disk state.
//!
//! A snapshot captures everything needed to reconstruct an instance: its
//! registry record, rendered env file, volumes tree, and a Runtime Driver
//! `inspect`-style view of its containers. The manifest chains to the
//! instance's previous backup via a SHA-256 hash over its own content,
//! the same primitive the operation log uses, so a tampered backup
//! directory is detectable the same way a tampered log entry is.

#![forbid(unsafe_code)]

use chrono::Utc;
use sbo_proto::{Backup, BackupComponent, ErrorKind, Instance};
use sbo_runtime::{RuntimeDriver, RuntimeTarget};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup manifest invalid or missing: {0}")]
    BackupInvalid(String),
    #[error("restore failed: {0}")]
    RestoreFailed(String),
    #[error("backup filesystem operation failed: {0}")]
    Io(#[source] std::io::Error),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackupInvalid(_) => ErrorKind::Backup,
            Self::RestoreFailed(_) => ErrorKind::Backup,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

const BACKUPS_DIR: &str = "auto-repair-backups";
const MANIFEST_FILE: &str = "backup-manifest.json";

fn backups_root(data_root: &Path) -> PathBuf {
    data_root.join(BACKUPS_DIR)
}

fn backup_dir(data_root: &Path, backup_id: &str) -> PathBuf {
    backups_root(data_root).join(backup_id)
}

fn manifest_age_warn_threshold() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

// ─── Snapshot ──────────────────────────────────────────────────────────────

/// Take a point-in-time snapshot of `instance` under `data_root`.
///
/// Every component is captured best-effort; a failing component still
/// yields a manifest entry with `success=false`. The snapshot as a whole
/// is considered valid iff the instance-config and environment components
/// both succeeded.
pub async fn snapshot(
    data_root: &Path,
    instance: &Instance,
    driver: &dyn RuntimeDriver,
    reason: &str,
    inspect_timeout: Duration,
) -> Result<Backup> {
    let timestamp = Utc::now();
    let backup_id = format!("{}_{}_{}", instance.id, reason, timestamp.format("%Y%m%dT%H%M%S%.3fZ"));
    let dir = backup_dir(data_root, &backup_id);
    std::fs::create_dir_all(&dir)?;

    let mut components = HashMap::new();

    components.insert(
        "instance_config".to_string(),
        capture_instance_config(&dir, instance),
    );
    components.insert(
        "environment".to_string(),
        capture_environment(&dir, instance),
    );
    components.insert("volumes".to_string(), capture_volumes(&dir, instance));
    components.insert(
        "container_states".to_string(),
        capture_container_states(&dir, instance, driver, inspect_timeout).await,
    );

    let size_mb = dir_size_bytes(&dir) as f64 / (1024.0 * 1024.0);
    let previous_manifest_hash = latest_manifest_hash(data_root, &instance.id).unwrap_or_default();

    let canonical = json!({
        "backup_id": backup_id,
        "instance_id": instance.id,
        "reason": reason,
        "timestamp": timestamp,
        "components": components,
        "size_mb": size_mb,
        "previous_manifest_hash": previous_manifest_hash,
    });
    let manifest_hash = sbo_oplog::sha256_hex(&canonical.to_string());

    let backup = Backup {
        backup_id: backup_id.clone(),
        instance_id: instance.id.clone(),
        reason: reason.to_string(),
        timestamp,
        components,
        size_mb,
        previous_manifest_hash,
        manifest_hash,
    };

    let manifest_json = serde_json::to_string_pretty(&backup).map_err(std::io::Error::other)?;
    std::fs::write(dir.join(MANIFEST_FILE), manifest_json)?;

    info!(backup_id = %backup.backup_id, instance_id = %instance.id, reason, "snapshot captured");
    Ok(backup)
}

fn capture_instance_config(dir: &Path, instance: &Instance) -> BackupComponent {
    let path = dir.join("instance-config.json");
    match serde_json::to_string_pretty(instance).map_err(std::io::Error::other).and_then(|s| std::fs::write(&path, s)) {
        Ok(()) => BackupComponent {
            success: true,
            artifact_path: Some(path.display().to_string()),
            error: None,
            sha256: sha256_of_file(&path),
        },
        Err(e) => BackupComponent { success: false, artifact_path: None, error: Some(e.to_string()), sha256: None },
    }
}

fn capture_environment(dir: &Path, instance: &Instance) -> BackupComponent {
    let src = Path::new(&instance.docker.env_file);
    let dst = dir.join("environment.env");
    match std::fs::copy(src, &dst) {
        Ok(_) => BackupComponent {
            success: true,
            artifact_path: Some(dst.display().to_string()),
            error: None,
            sha256: sha256_of_file(&dst),
        },
        Err(e) => BackupComponent { success: false, artifact_path: None, error: Some(e.to_string()), sha256: None },
    }
}

fn capture_volumes(dir: &Path, instance: &Instance) -> BackupComponent {
    let src = Path::new(&instance.docker.volumes_dir);
    let dst = dir.join("volumes");
    match copy_dir_recursive(src, &dst) {
        Ok(()) => {
            BackupComponent { success: true, artifact_path: Some(dst.display().to_string()), error: None, sha256: None }
        }
        Err(e) => {
            warn!(instance_id = %instance.id, error = %e, "failed to capture volumes tree");
            BackupComponent { success: false, artifact_path: None, error: Some(e.to_string()), sha256: None }
        }
    }
}

async fn capture_container_states(
    dir: &Path,
    instance: &Instance,
    driver: &dyn RuntimeDriver,
    timeout: Duration,
) -> BackupComponent {
    let target = expected_target(instance);
    match driver.list(&target, timeout).await {
        Ok(statuses) => {
            let path = dir.join("container-states.json");
            match serde_json::to_string_pretty(&statuses).map_err(std::io::Error::other).and_then(|s| std::fs::write(&path, s)) {
                Ok(()) => BackupComponent {
                    success: true,
                    artifact_path: Some(path.display().to_string()),
                    error: None,
                    sha256: sha256_of_file(&path),
                },
                Err(e) => BackupComponent { success: false, artifact_path: None, error: Some(e.to_string()), sha256: None },
            }
        }
        Err(e) => BackupComponent { success: false, artifact_path: None, error: Some(e.to_string()), sha256: None },
    }
}

fn expected_target(instance: &Instance) -> RuntimeTarget {
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

// ─── List ──────────────────────────────────────────────────────────────────

/// All backups under `data_root`, optionally filtered to one instance,
/// sorted newest first.
pub fn list(data_root: &Path, instance_id: Option<&str>) -> Vec<Backup> {
    let root = backups_root(data_root);
    let Ok(entries) = std::fs::read_dir(&root) else { return Vec::new() };

    let mut backups: Vec<Backup> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| load_manifest_from_dir(&e.path()))
        .filter(|b| instance_id.is_none_or(|id| b.instance_id == id))
        .collect();

    backups.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
    backups
}

fn load_manifest_from_dir(dir: &Path) -> Option<Backup> {
    let content = std::fs::read_to_string(dir.join(MANIFEST_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

fn load_manifest(data_root: &Path, backup_id: &str) -> Result<Backup> {
    load_manifest_from_dir(&backup_dir(data_root, backup_id))
        .ok_or_else(|| BackupError::BackupInvalid(format!("manifest missing for backup {backup_id}")))
}

fn latest_manifest_hash(data_root: &Path, instance_id: &str) -> Option<String> {
    list(data_root, Some(instance_id)).first().map(|b| b.manifest_hash.clone())
}

// ─── Verify ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub completeness: f64,
    pub chain_intact: bool,
    pub age_warning: bool,
}

/// Validate that `backup_id`'s manifest exists, that at least 80% of its
/// captured artifacts still exist on disk, and that its chain hash
/// matches the previous backup's recorded hash.
pub fn verify(data_root: &Path, backup_id: &str) -> Result<VerifyReport> {
    let manifest = load_manifest(data_root, backup_id)?;

    let total = manifest.components.len().max(1);
    let present = manifest
        .components
        .values()
        .filter(|c| c.success)
        .filter(|c| c.artifact_path.as_deref().is_some_and(|p| Path::new(p).exists()))
        .count();
    let completeness = present as f64 / total as f64;

    let config_ok = manifest.components.get("instance_config").is_some_and(|c| c.success);
    let env_ok = manifest.components.get("environment").is_some_and(|c| c.success);
    let valid = config_ok && env_ok && completeness >= 0.8;

    let chain_intact = verify_chain_link(data_root, &manifest);

    let age_warning = (Utc::now() - manifest.timestamp).to_std().unwrap_or(Duration::ZERO) > manifest_age_warn_threshold();

    Ok(VerifyReport { valid, completeness, chain_intact, age_warning })
}

fn verify_chain_link(data_root: &Path, manifest: &Backup) -> bool {
    if manifest.previous_manifest_hash.is_empty() {
        return true;
    }
    let siblings = list(data_root, Some(&manifest.instance_id));
    let Some(predecessor) = siblings.iter().find(|b| b.timestamp < manifest.timestamp) else {
        return false;
    };
    predecessor.manifest_hash == manifest.previous_manifest_hash
}

// ─── Cleanup ───────────────────────────────────────────────────────────────

/// Delete all but the most recent `keep` snapshots for `instance_id`.
pub fn cleanup(data_root: &Path, instance_id: &str, keep: usize) -> Result<usize> {
    let backups = list(data_root, Some(instance_id));
    let mut removed = 0;
    for backup in backups.into_iter().skip(keep) {
        let dir = backup_dir(data_root, &backup.backup_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ─── Restore ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RestoreChecks {
    pub registry_ok: bool,
    pub database_ok: bool,
    pub http_ok: bool,
}

impl RestoreChecks {
    fn pass_ratio(&self) -> f64 {
        let passed = [self.registry_ok, self.database_ok, self.http_ok].iter().filter(|p| **p).count();
        passed as f64 / 3.0
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub success: bool,
    pub instance: Option<Instance>,
    pub checks: RestoreChecks,
    pub message: String,
}

/// Restore `instance_id` from `backup_id`: stop the current instance
/// best-effort, restore its config/env/volumes, bring it back up, and
/// quick-health-check the result. Succeeds iff at least 60% of the three
/// post-restore checks (registry, database, HTTP) pass.
pub async fn restore(
    data_root: &Path,
    driver: &dyn RuntimeDriver,
    backup_id: &str,
    up_timeout: Duration,
    probe_timeouts: &sbo_health::ProbeTimeouts,
) -> Result<RestoreOutcome> {
    let report = verify(data_root, backup_id)?;
    if !report.valid {
        return Err(BackupError::BackupInvalid(format!(
            "backup {backup_id} failed verification (completeness={:.0}%)",
            report.completeness * 100.0
        )));
    }
    if report.age_warning {
        warn!(backup_id, "restoring from a backup older than 24h");
    }

    let manifest = load_manifest(data_root, backup_id)?;
    let dir = backup_dir(data_root, backup_id);

    let config_path = manifest
        .components
        .get("instance_config")
        .and_then(|c| c.artifact_path.as_deref())
        .ok_or_else(|| BackupError::BackupInvalid("missing instance-config artifact".into()))?;
    let instance: Instance = serde_json::from_str(&std::fs::read_to_string(config_path)?).map_err(std::io::Error::other)?;

    let target = expected_target(&instance);

    if let Err(e) = driver.stop(&target, up_timeout).await {
        warn!(instance_id = %instance.id, error = %e, "best-effort stop before restore failed, continuing");
    }

    std::fs::copy(dir.join("environment.env"), &instance.docker.env_file)?;

    let volumes_dst = Path::new(&instance.docker.volumes_dir);
    if volumes_dst.exists() {
        std::fs::remove_dir_all(volumes_dst)?;
    }
    copy_dir_recursive(&dir.join("volumes"), volumes_dst)?;

    let mut checks = RestoreChecks { registry_ok: true, ..Default::default() };

    match driver.up(&target, up_timeout).await {
        Ok(()) => {
            let _ = driver.wait_healthy(&target, up_timeout).await;
            let diagnostic = sbo_health::quick_health_check(driver, &instance, &target, probe_timeouts).await;
            checks.database_ok = diagnostic.results.get("database").is_some_and(|r| r.healthy);
            checks.http_ok = diagnostic.results.get("http_services").is_some_and(|r| r.healthy);
        }
        Err(e) => {
            return Ok(RestoreOutcome {
                success: false,
                instance: Some(instance),
                checks,
                message: format!("failed to bring instance back up: {e}"),
            });
        }
    }

    let success = checks.pass_ratio() >= 0.6;
    let message = if success {
        format!("restored from {backup_id}")
    } else {
        format!("restore from {backup_id} completed but post-restore checks failed")
    };

    info!(instance_id = %instance.id, backup_id, success, "restore complete");
    Ok(RestoreOutcome { success, instance: Some(instance), checks, message })
}

// ─── Filesystem helpers ──────────────────────────────────────────────────────

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    if !src.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &dst_path)?;
        } else {
            std::fs::copy(&path, &dst_path)?;
        }
    }
    Ok(())
}

fn dir_size_bytes(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(path) else { return 0 };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size_bytes(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

fn sha256_of_file(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|bytes| sbo_oplog::sha256_hex(&String::from_utf8_lossy(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbo_proto::{Credentials, DockerPaths, Instance, InstanceStatus, InstanceUrls, PortSet};
    use sbo_runtime::InMemoryDriver;

    fn sample_instance(data_root: &Path) -> Instance {
        let env_file = data_root.join(".env-i1");
        std::fs::write(&env_file, "POSTGRES_PASSWORD=secret\n").unwrap();
        let volumes_dir = data_root.join("volumes-i1");
        std::fs::create_dir_all(volumes_dir.join("db")).unwrap();
        std::fs::write(volumes_dir.join("db").join("seed.sql"), "select 1;").unwrap();

        Instance {
            id: "i1".into(),
            name: "alpha".into(),
            organization: "acme".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: InstanceStatus::Running,
            ports: PortSet { gateway_http: 8101, gateway_https: 8401, database_external: 5501, analytics: 4101 },
            credentials: Credentials {
                database_password: "secret".into(),
                signing_secret: "a".repeat(64),
                anon_key: "anon".into(),
                service_role_key: "service".into(),
                dashboard_username: "admin".into(),
                dashboard_password: "pw".into(),
            },
            docker: DockerPaths {
                compose_file: data_root.join("docker-compose-i1.yml").display().to_string(),
                env_file: env_file.display().to_string(),
                volumes_dir: volumes_dir.display().to_string(),
            },
            urls: InstanceUrls::derive("localhost", 8101),
            last_repair: None,
            last_diagnostic_at: None,
        }
    }

    #[tokio::test]
    async fn test_snapshot_captures_all_components() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();

        let backup = snapshot(dir.path(), &instance, &driver, "test", Duration::from_secs(5)).await.unwrap();
        assert_eq!(backup.instance_id, "i1");
        assert!(backup.components.get("instance_config").unwrap().success);
        assert!(backup.components.get("environment").unwrap().success);
        assert!(backup.components.get("volumes").unwrap().success);
    }

    #[tokio::test]
    async fn test_snapshot_chains_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();

        let first = snapshot(dir.path(), &instance, &driver, "one", Duration::from_secs(5)).await.unwrap();
        let second = snapshot(dir.path(), &instance, &driver, "two", Duration::from_secs(5)).await.unwrap();

        assert_eq!(second.previous_manifest_hash, first.manifest_hash);
    }

    #[tokio::test]
    async fn test_list_sorted_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();

        snapshot(dir.path(), &instance, &driver, "first", Duration::from_secs(5)).await.unwrap();
        let second = snapshot(dir.path(), &instance, &driver, "second", Duration::from_secs(5)).await.unwrap();

        let backups = list(dir.path(), Some("i1"));
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].backup_id, second.backup_id);
    }

    #[tokio::test]
    async fn test_verify_valid_backup() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();

        let backup = snapshot(dir.path(), &instance, &driver, "test", Duration::from_secs(5)).await.unwrap();
        let report = verify(dir.path(), &backup.backup_id).unwrap();
        assert!(report.valid);
        assert!(report.chain_intact);
        assert!(!report.age_warning);
    }

    #[tokio::test]
    async fn test_verify_missing_backup_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify(dir.path(), "nonexistent").unwrap_err();
        assert!(matches!(err, BackupError::BackupInvalid(_)));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();

        for i in 0..7 {
            snapshot(dir.path(), &instance, &driver, &format!("r{i}"), Duration::from_secs(5)).await.unwrap();
        }
        let removed = cleanup(dir.path(), "i1", 5).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(list(dir.path(), Some("i1")).len(), 5);
    }

    #[tokio::test]
    async fn test_restore_round_trips_core_fields() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();
        let target = expected_target(&instance);
        driver.up(&target, Duration::from_secs(1)).await.unwrap();

        let backup = snapshot(dir.path(), &instance, &driver, "pre-repair", Duration::from_secs(5)).await.unwrap();

        // Mutate the live env file to simulate a broken edit, then restore.
        std::fs::write(&instance.docker.env_file, "POSTGRES_PASSWORD=corrupted\n").unwrap();

        let outcome = restore(
            dir.path(),
            &driver,
            &backup.backup_id,
            Duration::from_secs(5),
            &sbo_health::ProbeTimeouts::default(),
        )
        .await
        .unwrap();

        let restored = outcome.instance.unwrap();
        assert_eq!(restored.ports.gateway_http, instance.ports.gateway_http);
        assert_eq!(restored.credentials.database_password, instance.credentials.database_password);
        assert_eq!(restored.name, instance.name);
        assert_eq!(restored.organization, instance.organization);

        let env_content = std::fs::read_to_string(&instance.docker.env_file).unwrap();
        assert!(env_content.contains("secret"));
    }

    #[tokio::test]
    async fn test_restore_rejects_invalid_backup() {
        let dir = tempfile::tempdir().unwrap();
        let instance = sample_instance(dir.path());
        let driver = InMemoryDriver::new();
        let backup = snapshot(dir.path(), &instance, &driver, "test", Duration::from_secs(5)).await.unwrap();

        // Corrupt the manifest's completeness by deleting an artifact.
        std::fs::remove_file(dir.path().join(BACKUPS_DIR).join(&backup.backup_id).join("environment.env")).unwrap();
        std::fs::remove_file(dir.path().join(BACKUPS_DIR).join(&backup.backup_id).join("instance-config.json")).unwrap();

        let err = restore(
            dir.path(),
            &driver,
            &backup.backup_id,
            Duration::from_secs(5),
            &sbo_health::ProbeTimeouts::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::BackupInvalid(_)));
    }
}
