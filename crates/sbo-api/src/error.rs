//! Translates every crate-boundary error this router touches into the
//! `{success:false, error, kind}` envelope and the status code `kind`
//! maps to, per the HTTP surface's propagation policy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sbo_proto::ErrorKind;
use serde_json::json;

pub struct ApiError {
    kind: ErrorKind,
    tag: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, tag: &'static str, message: impl Into<String>) -> Self {
        Self { kind, tag, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "NotFound", message)
    }

    pub fn bad_request(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, tag, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({"success": false, "error": self.message, "kind": self.tag}))).into_response()
    }
}

fn allocator_tag(e: &sbo_allocator::AllocatorError) -> &'static str {
    match e {
        sbo_allocator::AllocatorError::PortExhausted { .. } => "PortExhausted",
        sbo_allocator::AllocatorError::IdExhausted { .. } => "IdExhausted",
    }
}

impl From<sbo_lifecycle::LifecycleError> for ApiError {
    fn from(e: sbo_lifecycle::LifecycleError) -> Self {
        use sbo_lifecycle::LifecycleError as E;
        let kind = e.kind();
        let tag: &'static str = match &e {
            E::NotFound(_) => "NotFound",
            E::InvalidName(_) => "FieldValidationFailed",
            E::CapacityExceeded { .. } => "CapacityExceeded",
            E::CreateInProgress => "CreateInProgress",
            E::Allocator(inner) => allocator_tag(inner),
            E::Render(_) => "RenderError",
            E::Runtime(_) => "RuntimeError",
            E::Backup(_) => "BackupError",
            E::ProvisioningFailed(_) => "ProvisioningFailed",
            E::Io(_) => "IoError",
        };
        Self::new(kind, tag, e.to_string())
    }
}

impl From<sbo_repair::RepairError> for ApiError {
    fn from(e: sbo_repair::RepairError) -> Self {
        Self::new(e.kind(), "RepairError", e.to_string())
    }
}

impl From<sbo_backup::BackupError> for ApiError {
    fn from(e: sbo_backup::BackupError) -> Self {
        let tag = match &e {
            sbo_backup::BackupError::BackupInvalid(_) => "BackupInvalid",
            sbo_backup::BackupError::RestoreFailed(_) => "RestoreFailed",
            sbo_backup::BackupError::Io(_) => "IoError",
        };
        Self::new(e.kind(), tag, e.to_string())
    }
}

impl From<sbo_diagnostics::DiagnosticsError> for ApiError {
    fn from(e: sbo_diagnostics::DiagnosticsError) -> Self {
        Self::new(e.kind(), "DiagnosticsRateLimited", e.to_string())
    }
}
