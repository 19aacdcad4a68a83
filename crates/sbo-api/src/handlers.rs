use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use sbo_diagnostics::GateOutcome;
use sbo_health::run_full_diagnostic;
use sbo_lifecycle::config_editor::{self, FieldEdit};
use sbo_proto::{Diagnostic, Instance};
use serde::{Deserialize, Serialize};
use tracing::instrument;

fn target_for(instance: &Instance) -> sbo_runtime::RuntimeTarget {
    sbo_runtime::RuntimeTarget {
        instance_id: instance.id.clone(),
        compose_file: instance.docker.compose_file.clone(),
        env_file: instance.docker.env_file.clone(),
        container_names: sbo_proto::EXPECTED_CONTAINERS
            .iter()
            .map(|role| sbo_proto::container_name(&instance.id, role))
            .collect(),
    }
}

// ─── health ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime: i64,
    version: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", uptime: state.uptime_seconds(), version: env!("CARGO_PKG_VERSION") })
}

// ─── metrics ─────────────────────────────────────────────────────────────────

/// Prometheus text exposition of this process's live operation counters.
pub async fn metrics(State(state): State<AppState>) -> String {
    sbo_observe::MetricsExporter::new(state.metrics.clone()).render()
}

// ─── instances ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct InstanceStats {
    total: usize,
    running: usize,
    stopped: usize,
    creating: usize,
    error: usize,
}

#[derive(Serialize)]
pub struct ListInstancesResponse {
    instances: Vec<Instance>,
    stats: InstanceStats,
}

pub async fn list_instances(State(state): State<AppState>) -> Json<ListInstancesResponse> {
    let instances = state.lifecycle.list_instances().await;
    let stats = InstanceStats {
        total: instances.len(),
        running: instances.iter().filter(|i| i.status == sbo_proto::InstanceStatus::Running).count(),
        stopped: instances.iter().filter(|i| i.status == sbo_proto::InstanceStatus::Stopped).count(),
        creating: instances.iter().filter(|i| i.status == sbo_proto::InstanceStatus::Creating).count(),
        error: instances.iter().filter(|i| i.status == sbo_proto::InstanceStatus::Error).count(),
    };
    Json(ListInstancesResponse { instances, stats })
}

#[derive(Deserialize)]
pub struct CreateInstanceConfig {
    organization: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    project_name: String,
    config: Option<CreateInstanceConfig>,
}

#[derive(Serialize)]
pub struct CreateInstanceResponse {
    success: bool,
    instance: Instance,
    message: String,
}

#[instrument(skip(state))]
pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<Json<CreateInstanceResponse>, ApiError> {
    state.metrics.record_create_attempt();
    let organization = body.config.and_then(|c| c.organization);
    match state.lifecycle.create_instance(&body.project_name, organization).await {
        Ok(instance) => Ok(Json(CreateInstanceResponse { success: true, message: "instance created".into(), instance })),
        Err(e) => {
            state.metrics.record_create_error();
            Err(e.into())
        }
    }
}

#[derive(Serialize)]
pub struct MessageResponse {
    success: bool,
    message: String,
}

pub async fn start_instance(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MessageResponse>, ApiError> {
    state.lifecycle.start_instance(&id).await?;
    Ok(Json(MessageResponse { success: true, message: "instance started".into() }))
}

pub async fn stop_instance(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MessageResponse>, ApiError> {
    state.lifecycle.stop_instance(&id).await?;
    Ok(Json(MessageResponse { success: true, message: "instance stopped".into() }))
}

pub async fn delete_instance(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MessageResponse>, ApiError> {
    state.lifecycle.delete_instance(&id).await?;
    state.metrics.record_delete();
    Ok(Json(MessageResponse { success: true, message: "instance deleted".into() }))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    container: Option<String>,
    tail: Option<usize>,
}

#[derive(Serialize)]
pub struct LogsResponse {
    success: bool,
    logs: String,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let container = query.container.as_deref().unwrap_or("db");
    let tail = query.tail.unwrap_or(200);
    let logs = state.lifecycle.logs(&id, container, tail).await?;
    Ok(Json(LogsResponse { success: true, logs }))
}

// ─── diagnostics ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct DiagnosticResponse {
    success: bool,
    diagnostic: Option<Diagnostic>,
    message: Option<String>,
}

pub async fn run_diagnostics(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DiagnosticResponse>, ApiError> {
    let instance = state.lifecycle.get_instance(&id).await.ok_or_else(|| ApiError::not_found(format!("instance not found: {id}")))?;

    let diagnostic = match state.diagnostics.gate(&id)? {
        GateOutcome::UseCached(diagnostic) => {
            state.metrics.record_diagnostic_rate_limited();
            diagnostic
        }
        GateOutcome::Proceed => {
            let target = target_for(&instance);
            let diagnostic = run_full_diagnostic(state.lifecycle.driver().as_ref(), &instance, &target, state.lifecycle.probe_timeouts()).await;
            state.diagnostics.record(diagnostic.clone());
            state.metrics.record_diagnostic();
            let mut updated = instance;
            updated.last_diagnostic_at = Some(diagnostic.timestamp);
            state.lifecycle.record_instance(updated).await;
            diagnostic
        }
    };

    Ok(Json(DiagnosticResponse { success: true, diagnostic: Some(diagnostic), message: None }))
}

pub async fn last_diagnostic(State(state): State<AppState>, Path(id): Path<String>) -> Json<DiagnosticResponse> {
    match state.diagnostics.get_last(&id) {
        Some(diagnostic) => Json(DiagnosticResponse { success: true, diagnostic: Some(diagnostic), message: None }),
        None => Json(DiagnosticResponse { success: false, diagnostic: None, message: Some("no fresh diagnostic on record".into()) }),
    }
}

// ─── auto-repair ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRepairRequest {
    user_confirmed: bool,
    backup: Option<bool>,
    auto_rollback: Option<bool>,
    force: Option<bool>,
}

#[derive(Serialize)]
pub struct AutoRepairResponse {
    success: bool,
    repair_performed: bool,
    rollback_performed: bool,
    message: String,
}

pub async fn auto_repair(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AutoRepairRequest>,
) -> Result<Json<AutoRepairResponse>, ApiError> {
    if !body.user_confirmed {
        return Err(ApiError::bad_request("UserConfirmationRequired", "auto-repair requires userConfirmed:true"));
    }

    let lock = state.lifecycle.lock_for(&id);
    let _guard = lock.lock().await;

    let mut instance = state.lifecycle.get_instance(&id).await.ok_or_else(|| ApiError::not_found(format!("instance not found: {id}")))?;

    let options = sbo_repair::RepairOptions {
        force: body.force.unwrap_or(false),
        backup: body.backup.unwrap_or(true),
        auto_rollback: body.auto_rollback.unwrap_or(true),
    };

    state.metrics.record_repair_attempt();
    let outcome = sbo_repair::repair(state.lifecycle.data_root(), state.lifecycle.driver().as_ref(), &mut instance, options, state.lifecycle.probe_timeouts())
        .await?;
    state.lifecycle.record_instance(instance).await;

    let response = match outcome {
        sbo_repair::RepairOutcome::NoRepairNecessary => {
            AutoRepairResponse { success: true, repair_performed: false, rollback_performed: false, message: "instance already healthy".into() }
        }
        sbo_repair::RepairOutcome::ManualInterventionRequired => {
            AutoRepairResponse { success: false, repair_performed: false, rollback_performed: false, message: "no automated action available".into() }
        }
        sbo_repair::RepairOutcome::Success { .. } => {
            state.metrics.record_repair_success();
            AutoRepairResponse { success: true, repair_performed: true, rollback_performed: false, message: "repair succeeded".into() }
        }
        sbo_repair::RepairOutcome::Failed { rollback_performed, message, .. } => {
            if rollback_performed {
                state.metrics.record_repair_rollback();
            }
            AutoRepairResponse { success: false, repair_performed: true, rollback_performed, message }
        }
        sbo_repair::RepairOutcome::CriticalFailure { message, .. } => {
            AutoRepairResponse { success: false, repair_performed: true, rollback_performed: false, message }
        }
    };

    Ok(Json(response))
}

// ─── backup / restore ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct BackupResponse {
    success: bool,
    backup: sbo_proto::Backup,
}

pub async fn create_backup(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<BackupResponse>, ApiError> {
    let instance = state.lifecycle.get_instance(&id).await.ok_or_else(|| ApiError::not_found(format!("instance not found: {id}")))?;
    match sbo_backup::snapshot(state.lifecycle.data_root(), &instance, state.lifecycle.driver().as_ref(), "manual", std::time::Duration::from_secs(10)).await {
        Ok(backup) => {
            state.metrics.record_backup();
            let _ = sbo_backup::cleanup(state.lifecycle.data_root(), &id, state.backup_retention);
            Ok(Json(BackupResponse { success: true, backup }))
        }
        Err(e) => {
            state.metrics.record_backup_error();
            Err(e.into())
        }
    }
}

#[derive(Serialize)]
pub struct ListBackupsResponse {
    success: bool,
    backups: Vec<sbo_proto::Backup>,
}

pub async fn list_backups(State(state): State<AppState>, Path(id): Path<String>) -> Json<ListBackupsResponse> {
    Json(ListBackupsResponse { success: true, backups: sbo_backup::list(state.lifecycle.data_root(), Some(&id)) })
}

#[derive(Serialize)]
pub struct RestoreResponse {
    success: bool,
    message: String,
}

pub async fn restore_backup(
    State(state): State<AppState>,
    Path((id, backup_id)): Path<(String, String)>,
) -> Result<Json<RestoreResponse>, ApiError> {
    let lock = state.lifecycle.lock_for(&id);
    let _guard = lock.lock().await;

    match sbo_backup::restore(state.lifecycle.data_root(), state.lifecycle.driver().as_ref(), &backup_id, std::time::Duration::from_secs(60), state.lifecycle.probe_timeouts()).await {
        Ok(outcome) => {
            state.metrics.record_restore();
            if let Some(instance) = outcome.instance {
                state.lifecycle.record_instance(instance).await;
            }
            Ok(Json(RestoreResponse { success: outcome.success, message: outcome.message }))
        }
        Err(e) => {
            state.metrics.record_restore_error();
            Err(e.into())
        }
    }
}

// ─── config editor ───────────────────────────────────────────────────────────

pub async fn editable_fields() -> Json<Vec<&'static str>> {
    Json(config_editor::EDITABLE_FIELDS.to_vec())
}

#[derive(Serialize)]
pub struct ConfigFieldResponse {
    success: bool,
    field: String,
    value: Option<String>,
}

pub async fn get_config_field(State(state): State<AppState>, Path((id, field)): Path<(String, String)>) -> Result<Json<ConfigFieldResponse>, ApiError> {
    let instance = state.lifecycle.get_instance(&id).await.ok_or_else(|| ApiError::not_found(format!("instance not found: {id}")))?;
    let value = match field.as_str() {
        "name" => Some(instance.name.clone()),
        "organization" => Some(instance.organization.clone()),
        "dashboard_username" => Some(instance.credentials.dashboard_username.clone()),
        "dashboard_password" => Some(instance.credentials.dashboard_password.clone()),
        _ if config_editor::EDITABLE_FIELDS.contains(&field.as_str()) || field == config_editor::JWT_EXPIRY_FIELD => None,
        _ => return Err(ApiError::bad_request("FieldValidationFailed", format!("{field} is not an editable field"))),
    };
    Ok(Json(ConfigFieldResponse { success: true, field, value }))
}

#[derive(Deserialize)]
pub struct FieldValueRequest {
    value: String,
}

#[derive(Serialize)]
pub struct ConfigEditResponse {
    success: bool,
    rolled_back: bool,
    backup_id: String,
    message: String,
    instance: Instance,
}

fn into_response(outcome: sbo_lifecycle::config_editor::ConfigEditOutcome, state: &AppState) -> ConfigEditResponse {
    if !outcome.success {
        state.metrics.record_config_edit_rollback();
    }
    ConfigEditResponse {
        success: outcome.success,
        rolled_back: outcome.rolled_back,
        backup_id: outcome.backup_id,
        message: outcome.message,
        instance: outcome.instance,
    }
}

pub async fn put_config_field(
    State(state): State<AppState>,
    Path((id, field)): Path<(String, String)>,
    Json(body): Json<FieldValueRequest>,
) -> Result<Json<ConfigEditResponse>, ApiError> {
    state.metrics.record_config_edit();
    let outcome = config_editor::edit_field(&state.lifecycle, &id, &field, &body.value).await?;
    Ok(Json(into_response(outcome, &state)))
}

#[derive(Deserialize)]
pub struct BulkFieldEdit {
    field: String,
    value: String,
}

#[derive(Deserialize)]
pub struct BulkConfigRequest {
    edits: Vec<BulkFieldEdit>,
}

pub async fn put_config_bulk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BulkConfigRequest>,
) -> Result<Json<ConfigEditResponse>, ApiError> {
    state.metrics.record_config_edit();
    let edits: Vec<FieldEdit> = body.edits.into_iter().map(|e| FieldEdit { field: e.field, value: e.value }).collect();
    let outcome = config_editor::edit_fields(&state.lifecycle, &id, &edits).await?;
    Ok(Json(into_response(outcome, &state)))
}
