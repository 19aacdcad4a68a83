//! Shared fixtures for the integration tests under `tests/`.
//!
//! Every scenario wires real component crates together against an
//! [`sbo_runtime::InMemoryDriver`] rather than mocking at a narrower
//! boundary, so these tests exercise the same call paths production code
//! does — only the container runtime and the instance's network-facing
//! probes are unable to reach anything real.

use chrono::Utc;
use sbo_lifecycle::LifecycleController;
use sbo_proto::{Credentials, DockerPaths, Instance, InstanceStatus, InstanceUrls, PortSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn write_templates(root: &Path) {
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

/// Build a controller over a fresh [`sbo_runtime::InMemoryDriver`], with
/// rendered templates and a data root under `dir`.
pub fn controller(dir: &Path, max_instances: usize) -> LifecycleController {
    let templates = dir.join("templates");
    write_templates(&templates);
    let data_root = dir.join("data");
    std::fs::create_dir_all(&data_root).unwrap();
    LifecycleController::new(
        data_root,
        "localhost".to_string(),
        &templates,
        Arc::new(sbo_runtime::InMemoryDriver::new()),
        max_instances,
        Duration::from_secs(5),
    )
}

/// A fully-populated instance record occupying `gateway_http`, for
/// pre-filling the registry in port-exhaustion scenarios. Never rendered
/// or brought up — only its `ports` field is read by the allocator.
pub fn filler_instance(id: &str, gateway_http: u16) -> Instance {
    Instance {
        id: id.to_string(),
        name: format!("filler-{id}"),
        organization: "acme".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        status: InstanceStatus::Running,
        ports: PortSet { gateway_http, gateway_https: 8400, database_external: 5500, analytics: 4100 },
        credentials: Credentials {
            database_password: "x".into(),
            signing_secret: "a".repeat(64),
            anon_key: "anon".into(),
            service_role_key: "service".into(),
            dashboard_username: "admin".into(),
            dashboard_password: "pw".into(),
        },
        docker: DockerPaths { compose_file: String::new(), env_file: String::new(), volumes_dir: String::new() },
        urls: InstanceUrls::derive("localhost", gateway_http),
        last_repair: None,
        last_diagnostic_at: None,
    }
}

/// A runnable instance with a real env file on disk, for scenarios that
/// exercise backup/restore or the repair engine directly rather than
/// going through [`LifecycleController::create_instance`].
pub fn standalone_instance(dir: &Path, id: &str) -> Instance {
    let env_file = dir.join(format!(".env-{id}"));
    std::fs::write(&env_file, "POSTGRES_PASSWORD=old\nJWT_SECRET=old-secret\n").unwrap();
    let volumes_dir = dir.join(format!("volumes-{id}"));
    std::fs::create_dir_all(&volumes_dir).unwrap();

    Instance {
        id: id.to_string(),
        name: "alpha".to_string(),
        organization: "acme".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        status: InstanceStatus::Running,
        ports: PortSet { gateway_http: 8101, gateway_https: 8401, database_external: 5501, analytics: 4101 },
        credentials: Credentials {
            database_password: "old".into(),
            signing_secret: "a".repeat(64),
            anon_key: "anon".into(),
            service_role_key: "service".into(),
            dashboard_username: "admin".into(),
            dashboard_password: "pw".into(),
        },
        docker: DockerPaths {
            compose_file: dir.join(format!("docker-compose-{id}.yml")).display().to_string(),
            env_file: env_file.display().to_string(),
            volumes_dir: volumes_dir.display().to_string(),
        },
        urls: InstanceUrls::derive("localhost", 8101),
        last_repair: None,
        last_diagnostic_at: None,
    }
}
