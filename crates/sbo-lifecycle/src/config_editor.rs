//! Safe Config Editor: snapshot-before-edit, apply, health-check,
//! rollback-on-failure for a fixed allow-list of fields.
//!
//! Grounded on the same backup/restore primitives the repair engine uses
//! rather than on the teacher's `config_cmd.rs`, which edits a plain
//! key/value store with no snapshot or rollback step at all.

use crate::{target_for, LifecycleController, LifecycleError, Result};
use sbo_oplog::{OperationAction, OperationResult};
use sbo_proto::Instance;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Fields a caller may edit through [`edit_field`] / [`edit_fields`].
/// Anything not listed here is rejected with [`LifecycleError::InvalidName`]
/// reused as a generic validation error, since the shared error taxonomy
/// has no dedicated field-validation variant.
pub const EDITABLE_FIELDS: [&str; 6] =
    ["name", "dashboard_username", "dashboard_password", "organization", "disable_signup", "enable_email_autoconfirm"];

pub const JWT_EXPIRY_FIELD: &str = "jwt_expiry";

#[derive(Debug, Clone)]
pub struct FieldEdit {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ConfigEditOutcome {
    pub success: bool,
    pub instance: Instance,
    pub backup_id: String,
    pub rolled_back: bool,
    pub message: String,
}

fn validate_edit(edit: &FieldEdit) -> Result<()> {
    if edit.field == JWT_EXPIRY_FIELD {
        let seconds: i64 = edit
            .value
            .parse()
            .map_err(|_| LifecycleError::InvalidName(format!("{}: not an integer", edit.field)))?;
        if !(60..=86_400).contains(&seconds) {
            return Err(LifecycleError::InvalidName(format!("{}: must be between 60 and 86400", edit.field)));
        }
        return Ok(());
    }

    if !EDITABLE_FIELDS.contains(&edit.field.as_str()) {
        return Err(LifecycleError::InvalidName(format!("{} is not an editable field", edit.field)));
    }

    match edit.field.as_str() {
        "disable_signup" | "enable_email_autoconfirm" => {
            edit.value
                .parse::<bool>()
                .map_err(|_| LifecycleError::InvalidName(format!("{}: must be true or false", edit.field)))?;
        }
        "name" => {
            if !sbo_proto::validate_instance_name(&edit.value) {
                return Err(LifecycleError::InvalidName(format!("{}: {}", edit.field, edit.value)));
            }
        }
        _ => {
            if edit.value.is_empty() {
                return Err(LifecycleError::InvalidName(format!("{}: must not be empty", edit.field)));
            }
        }
    }
    Ok(())
}

/// Apply `edit` to the in-memory `instance` record (fields tracked on the
/// struct) and return the environment-file key/value it also needs
/// writing, if any (fields that only live in the rendered env file).
fn apply_to_instance(instance: &mut Instance, edit: &FieldEdit) -> Option<(String, String)> {
    match edit.field.as_str() {
        "name" => {
            instance.name = edit.value.clone();
            None
        }
        "organization" => {
            instance.organization = edit.value.clone();
            None
        }
        "dashboard_username" => {
            instance.credentials.dashboard_username = edit.value.clone();
            Some(("DASHBOARD_USERNAME".to_string(), edit.value.clone()))
        }
        "dashboard_password" => {
            instance.credentials.dashboard_password = edit.value.clone();
            Some(("DASHBOARD_PASSWORD".to_string(), edit.value.clone()))
        }
        "disable_signup" => Some(("DISABLE_SIGNUP".to_string(), edit.value.clone())),
        "enable_email_autoconfirm" => Some(("ENABLE_EMAIL_AUTOCONFIRM".to_string(), edit.value.clone())),
        "jwt_expiry" => Some(("JWT_EXPIRY".to_string(), edit.value.clone())),
        other => {
            warn!(field = other, "editable field has no apply rule, env file left untouched");
            None
        }
    }
}

/// Rewrite `key=value` lines for `values` in an env file, preserving
/// every other line and appending keys that aren't already present.
/// Same line-oriented discipline the repair engine's credential rewrite
/// uses, generalized to an arbitrary key set.
fn rewrite_env_fields(env_path: &Path, values: &HashMap<String, String>) -> std::io::Result<()> {
    let existing = std::fs::read_to_string(env_path).unwrap_or_default();
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut out_lines = Vec::new();

    for line in existing.lines() {
        if let Some((key, _)) = line.split_once('=') {
            if let Some(new_value) = values.get(key) {
                out_lines.push(format!("{key}={new_value}"));
                seen.insert(key);
                continue;
            }
        }
        out_lines.push(line.to_string());
    }

    for (key, value) in values {
        if !seen.contains(key.as_str()) {
            out_lines.push(format!("{key}={value}"));
        }
    }

    std::fs::write(env_path, out_lines.join("\n") + "\n")
}

/// Apply a batch of edits under one snapshot: either every edit in
/// `edits` lands and the instance comes back healthy, or the whole batch
/// is rolled back to the pre-edit snapshot.
pub async fn edit_fields(controller: &LifecycleController, instance_id: &str, edits: &[FieldEdit]) -> Result<ConfigEditOutcome> {
    for edit in edits {
        validate_edit(edit)?;
    }

    let lock = controller.lock_for(instance_id);
    let _guard = lock.lock().await;

    let mut instance = controller
        .get_instance(instance_id)
        .await
        .ok_or_else(|| LifecycleError::NotFound(instance_id.to_string()))?;

    let backup = sbo_backup::snapshot(
        controller.data_root(),
        &instance,
        controller.driver().as_ref(),
        "config_edit",
        Duration::from_secs(10),
    )
    .await?;

    let mut env_updates = HashMap::new();
    for edit in edits {
        if let Some((key, value)) = apply_to_instance(&mut instance, edit) {
            env_updates.insert(key, value);
        }
    }
    instance.updated_at = chrono::Utc::now();

    if !env_updates.is_empty() {
        if let Err(e) = rewrite_env_fields(Path::new(&instance.docker.env_file), &env_updates) {
            return Err(LifecycleError::Io(e));
        }
    }

    let target = target_for(&instance);
    // Gate on container-level health only, matching the create path: the
    // database/HTTP probes in a full health check fail soft against an
    // instance that's still settling after the container restarts below,
    // and an edit to e.g. the dashboard password never touches those
    // services anyway.
    let healthy = controller.driver().wait_healthy(&target, Duration::from_secs(30)).await.is_ok();

    if healthy {
        controller.record_instance(instance.clone()).await;
        controller
            .log_operation(
                OperationAction::EditConfig,
                instance_id,
                json!({"fields": edits.iter().map(|e| &e.field).collect::<Vec<_>>()}),
                OperationResult { success: true, message: "config edited".into(), details: None },
            )
            .await;
        return Ok(ConfigEditOutcome {
            success: true,
            instance,
            backup_id: backup.backup_id,
            rolled_back: false,
            message: "edit applied".to_string(),
        });
    }

    warn!(instance_id, "config edit left the instance unhealthy, rolling back");
    let restore_outcome = sbo_backup::restore(
        controller.data_root(),
        controller.driver().as_ref(),
        &backup.backup_id,
        Duration::from_secs(30),
        controller.probe_timeouts(),
    )
    .await?;

    let restored_instance = restore_outcome.instance.unwrap_or(instance);
    controller.record_instance(restored_instance.clone()).await;

    controller
        .log_operation(
            OperationAction::EditConfig,
            instance_id,
            json!({"fields": edits.iter().map(|e| &e.field).collect::<Vec<_>>()}),
            OperationResult { success: false, message: "edit rolled back after health check failure".into(), details: None },
        )
        .await;

    Ok(ConfigEditOutcome {
        success: false,
        instance: restored_instance,
        backup_id: backup.backup_id,
        rolled_back: true,
        message: "edit failed post-change health check and was rolled back".to_string(),
    })
}

pub async fn edit_field(controller: &LifecycleController, instance_id: &str, field: &str, value: &str) -> Result<ConfigEditOutcome> {
    edit_fields(controller, instance_id, &[FieldEdit { field: field.to_string(), value: value.to_string() }]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn write_templates(root: &Path) {
        std::fs::create_dir_all(root).unwrap();
        std::fs::write(
            root.join("docker-compose.yml.template"),
            "project: ${PROJECT_NAME}\ninstance: ${INSTANCE_ID}\nport: ${KONG_HTTP_PORT}\n",
        )
        .unwrap();
        std::fs::write(
            root.join(".env.template"),
            "POSTGRES_PASSWORD=${POSTGRES_PASSWORD}\nJWT_SECRET=${JWT_SECRET}\nDASHBOARD_USERNAME=${DASHBOARD_USERNAME}\n",
        )
        .unwrap();
    }

    async fn controller(dir: &Path) -> LifecycleController {
        let templates = dir.join("templates");
        write_templates(&templates);
        let data_root = dir.join("data");
        std::fs::create_dir_all(&data_root).unwrap();
        LifecycleController::new(
            data_root,
            "localhost".to_string(),
            &templates,
            Arc::new(sbo_runtime::InMemoryDriver::new()),
            10,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_edit_field_updates_instance_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(dir.path()).await;
        let instance = ctrl.create_instance("alpha", None).await.unwrap();

        let outcome = edit_field(&ctrl, &instance.id, "dashboard_username", "ops-team").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.instance.credentials.dashboard_username, "ops-team");

        let env = std::fs::read_to_string(&outcome.instance.docker.env_file).unwrap();
        assert!(env.contains("DASHBOARD_USERNAME=ops-team"));
    }

    #[tokio::test]
    async fn test_edit_rejects_field_not_on_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(dir.path()).await;
        let instance = ctrl.create_instance("alpha", None).await.unwrap();

        let err = edit_field(&ctrl, &instance.id, "database_password", "anything").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_edit_rejects_jwt_expiry_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(dir.path()).await;
        let instance = ctrl.create_instance("alpha", None).await.unwrap();

        let err = edit_field(&ctrl, &instance.id, JWT_EXPIRY_FIELD, "10").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_edit_fields_bulk_shares_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(dir.path()).await;
        let instance = ctrl.create_instance("alpha", None).await.unwrap();

        let edits = vec![
            FieldEdit { field: "organization".to_string(), value: "new-org".to_string() },
            FieldEdit { field: "dashboard_username".to_string(), value: "new-admin".to_string() },
        ];
        let outcome = edit_fields(&ctrl, &instance.id, &edits).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.instance.organization, "new-org");
        assert_eq!(outcome.instance.credentials.dashboard_username, "new-admin");
    }
}
