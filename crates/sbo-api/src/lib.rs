//! The `axum` router the dashboard talks to. A thin translation layer over
//! the Lifecycle Controller, Diagnostic Engine, Auto-Repair Engine, and
//! Backup component — no domain logic lives here, only request/response
//! shaping and status-code mapping.
//!
//! Mirrors the pack's `create_api_router(state) -> Router` shape: one
//! function assembling routes over a cloneable state, with no auth
//! middleware of its own — an embedding binary nests it under whatever
//! auth layer it likes.

#![forbid(unsafe_code)]

mod error;
mod handlers;
mod state;

pub use error::ApiError;
pub use state::AppState;

use axum::routing::{delete, get, post, put};
use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Build the router exposing every path the dashboard is documented to call.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/instances", get(handlers::list_instances).post(handlers::create_instance))
        .route("/api/instances/{id}/start", post(handlers::start_instance))
        .route("/api/instances/{id}/stop", post(handlers::stop_instance))
        .route("/api/instances/{id}", delete(handlers::delete_instance))
        .route("/api/instances/{id}/logs", get(handlers::get_logs))
        .route("/api/instances/{id}/run-diagnostics", get(handlers::run_diagnostics))
        .route("/api/instances/{id}/last-diagnostic", get(handlers::last_diagnostic))
        .route("/api/instances/{id}/auto-repair", post(handlers::auto_repair))
        .route("/api/instances/{id}/backup", post(handlers::create_backup))
        .route("/api/instances/{id}/backups", get(handlers::list_backups))
        .route("/api/instances/{id}/restore/{backup_id}", post(handlers::restore_backup))
        .route("/api/instances/{id}/config/editable-fields", get(handlers::editable_fields))
        .route(
            "/api/instances/{id}/config/bulk",
            put(handlers::put_config_bulk),
        )
        .route(
            "/api/instances/{id}/config/{field}",
            get(handlers::get_config_field).put(handlers::put_config_field),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .with_state(state)
}

/// Bind and serve the router until the process is terminated.
pub async fn start_api_server(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let router = create_api_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "HTTP surface listening");
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sbo_diagnostics::{DiagnosticEngine, DiagnosticsConfig};
    use sbo_lifecycle::LifecycleController;
    use sbo_observe::OperationsMetrics;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn write_templates(root: &std::path::Path) {
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

    fn test_state(dir: &std::path::Path) -> AppState {
        let templates = dir.join("templates");
        write_templates(&templates);
        let data_root = dir.join("data");
        std::fs::create_dir_all(&data_root).unwrap();
        let lifecycle = Arc::new(LifecycleController::new(
            data_root,
            "localhost".to_string(),
            &templates,
            Arc::new(sbo_runtime::InMemoryDriver::new()),
            10,
            Duration::from_secs(5),
        ));
        let diagnostics = Arc::new(DiagnosticEngine::new(DiagnosticsConfig::default()));
        let metrics = Arc::new(OperationsMetrics::new());
        AppState::new(lifecycle, diagnostics, metrics, 5)
    }

    #[tokio::test]
    async fn test_metrics_exposes_prometheus_text() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_api_router(test_state(dir.path()));
        let response = router.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("supa_orchestrator_creates_total"));
    }

    #[tokio::test]
    async fn test_health_never_errors() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_api_router(test_state(dir.path()));
        let response = router.oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_list_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_api_router(test_state(dir.path()));

        let create_req = Request::builder()
            .method("POST")
            .uri("/api/instances")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"projectName":"alpha","config":{"organization":"acme"}}"#))
            .unwrap();
        let response = router.clone().oneshot(create_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = parsed["instance"]["id"].as_str().unwrap().to_string();
        assert_eq!(parsed["instance"]["status"], "running");

        let list_response = router.clone().oneshot(Request::builder().uri("/api/instances").body(Body::empty()).unwrap()).await.unwrap();
        let body = axum::body::to_bytes(list_response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["stats"]["total"], 1);

        let delete_req = Request::builder().method("DELETE").uri(format!("/api/instances/{id}")).body(Body::empty()).unwrap();
        let response = router.clone().oneshot(delete_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let list_response = router.oneshot(Request::builder().uri("/api/instances").body(Body::empty()).unwrap()).await.unwrap();
        let body = axum::body::to_bytes(list_response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["stats"]["total"], 0);
    }

    #[tokio::test]
    async fn test_concurrent_create_one_wins_one_gets_409() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let router = create_api_router(state);

        let req = |name: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/instances")
                .header("content-type", "application/json")
                .body(Body::from(format!(r#"{{"projectName":"{name}"}}"#)))
                .unwrap()
        };

        let (r1, r2) = tokio::join!(router.clone().oneshot(req("p1")), router.oneshot(req("p2")));
        let statuses = [r1.unwrap().status(), r2.unwrap().status()];
        assert!(statuses.contains(&StatusCode::OK));
        assert!(statuses.contains(&StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn test_auto_repair_refuses_without_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let lifecycle = state.lifecycle.clone();
        let router = create_api_router(state);
        let instance = lifecycle.create_instance("alpha", None).await.unwrap();

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/instances/{}/auto-repair", instance.id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"userConfirmed":false}"#))
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_config_field_rejects_empty_value() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let lifecycle = state.lifecycle.clone();
        let router = create_api_router(state);
        let instance = lifecycle.create_instance("alpha", None).await.unwrap();

        let req = Request::builder()
            .method("PUT")
            .uri(format!("/api/instances/{}/config/dashboard_password", instance.id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"value":""}"#))
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
