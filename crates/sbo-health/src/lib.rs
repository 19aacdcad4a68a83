//! Bounded health probes over a single instance, composed into a full
//! diagnostic report.
//!
//! Every probe fails soft: a connection error, a timeout, or a bad status
//! code is captured in the returned [`ProbeOutcome`], never propagated as
//! an error out of the probe function itself. Only `run_full_diagnostic`
//! and `quick_health_check` are public entry points; individual probes are
//! exposed too so the Auto-Repair Engine can re-run a narrower set during
//! verification.

#![forbid(unsafe_code)]

use chrono::Utc;
use sbo_proto::{CriticalIssue, Diagnostic, Instance, ProbeCategory, ProbeOutcome, Severity};
use sbo_runtime::{RuntimeDriver, RuntimeTarget};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-probe-category bounded timeouts, per §5's suspension-point rule.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub containers: Duration,
    pub http: Duration,
    pub database: Duration,
    pub network: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            containers: Duration::from_secs(10),
            http: Duration::from_secs(5),
            database: Duration::from_secs(8),
            network: Duration::from_secs(3),
        }
    }
}

fn healthy(detail: serde_json::Value) -> ProbeOutcome {
    ProbeOutcome { healthy: true, detail, error: None }
}

fn unhealthy(detail: serde_json::Value, error: impl Into<String>) -> ProbeOutcome {
    ProbeOutcome { healthy: false, detail, error: Some(error.into()) }
}

// ─── Container probe ──────────────────────────────────────────────────────────

pub async fn probe_containers(
    driver: &dyn RuntimeDriver,
    target: &RuntimeTarget,
    timeout: Duration,
) -> ProbeOutcome {
    match driver.list(target, timeout).await {
        Ok(statuses) => {
            let all_running = statuses.iter().all(|s| s.running);
            let detail = json!({ "containers": statuses });
            if all_running {
                healthy(detail)
            } else {
                let missing: Vec<&str> =
                    statuses.iter().filter(|s| !s.running).map(|s| s.name.as_str()).collect();
                unhealthy(detail, format!("containers not running: {}", missing.join(", ")))
            }
        }
        Err(e) => unhealthy(json!({}), e.to_string()),
    }
}

// ─── HTTP services probe ──────────────────────────────────────────────────────

struct HttpCheck {
    name: &'static str,
    status: Option<u16>,
    rtt_ms: Option<u128>,
    error: Option<String>,
}

async fn get_with_rtt(client: &reqwest::Client, url: &str, headers: &[(&str, &str)]) -> HttpCheck {
    let start = Instant::now();
    let mut req = client.get(url);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    match req.send().await {
        Ok(resp) => HttpCheck {
            name: "",
            status: Some(resp.status().as_u16()),
            rtt_ms: Some(start.elapsed().as_millis()),
            error: None,
        },
        Err(e) => HttpCheck { name: "", status: None, rtt_ms: None, error: Some(e.to_string()) },
    }
}

pub async fn probe_http_services(instance: &Instance, timeout: Duration) -> ProbeOutcome {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return unhealthy(json!({}), e.to_string()),
    };
    let base = format!("http://{}", instance.urls.api.trim_start_matches("http://"));
    let gateway_url = format!("{base}/");
    let auth_url = format!("{base}/auth/v1/health");
    let rest_url = format!("{base}/rest/v1/");
    let studio_url = format!("{base}/");

    let (gateway, auth, rest, studio) = tokio::join!(
        get_with_rtt(&client, &gateway_url, &[]),
        get_with_rtt(&client, &auth_url, &[]),
        get_with_rtt(&client, &rest_url, &[("apikey", instance.credentials.anon_key.as_str())]),
        get_with_rtt(&client, &studio_url, &[]),
    );

    let checks = [
        ("gateway", gateway),
        ("auth", auth),
        ("rest", rest),
        ("studio", studio),
    ];

    let all_ok = checks.iter().all(|(_, c)| c.status.is_some_and(|s| s < 500));
    let detail = json!({
        "checks": checks.iter().map(|(name, c)| json!({
            "name": name,
            "status": c.status,
            "rtt_ms": c.rtt_ms,
            "error": c.error,
        })).collect::<Vec<_>>(),
    });

    if all_ok {
        healthy(detail)
    } else {
        let failing: Vec<&str> = checks
            .iter()
            .filter(|(_, c)| !c.status.is_some_and(|s| s < 500))
            .map(|(name, _)| *name)
            .collect();
        unhealthy(detail, format!("services unreachable or erroring: {}", failing.join(", ")))
    }
}

// ─── Database probe ───────────────────────────────────────────────────────────

fn database_url(instance: &Instance) -> String {
    format!(
        "postgres://postgres:{}@127.0.0.1:{}/postgres",
        instance.credentials.database_password, instance.ports.database_external
    )
}

pub async fn probe_database(instance: &Instance, timeout: Duration) -> ProbeOutcome {
    let url = database_url(instance);
    let connect = sqlx::postgres::PgPoolOptions::new().max_connections(1).acquire_timeout(timeout).connect(&url);

    let pool = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(pool)) => pool,
        Ok(Err(e)) => return unhealthy(json!({}), format!("connection failed: {e}")),
        Err(_) => return unhealthy(json!({}), "connection timed out"),
    };

    let start = Instant::now();
    let basic: Result<(i32, String, chrono::DateTime<Utc>), _> =
        sqlx::query_as("SELECT 1, version(), now()").fetch_one(&pool).await;
    let connection_time_ms = start.elapsed().as_millis();

    let (server_version, now) = match &basic {
        Ok((_, version, now)) => (Some(version.clone()), Some(*now)),
        Err(_) => (None, None),
    };

    let user_count: Result<(i64,), _> = sqlx::query_as("SELECT count(*) FROM auth.users").fetch_one(&pool).await;

    let extensions: Result<Vec<(String,)>, _> = sqlx::query_as(
        "SELECT extname FROM pg_extension WHERE extname = ANY($1)",
    )
    .bind(["uuid-ossp", "pgcrypto", "pgjwt"].as_slice())
    .fetch_all(&pool)
    .await;

    let detail = json!({
        "connection_time_ms": connection_time_ms,
        "server_version": server_version,
        "now": now,
        "user_count": user_count.as_ref().ok().map(|(n,)| *n),
        "extensions": extensions.as_ref().ok().map(|rows| rows.iter().map(|(n,)| n.clone()).collect::<Vec<_>>()),
    });

    if basic.is_ok() && user_count.is_ok() && extensions.is_ok() {
        healthy(detail)
    } else {
        unhealthy(detail, "one or more database queries failed")
    }
}

// ─── Auth deep-probe ───────────────────────────────────────────────────────────

pub async fn probe_auth_deep(instance: &Instance, timeout: Duration) -> ProbeOutcome {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return unhealthy(json!({}), e.to_string()),
    };
    let base = &instance.urls.api;

    let health = get_with_rtt(&client, &format!("{base}/auth/v1/health"), &[]).await;
    let settings = get_with_rtt(
        &client,
        &format!("{base}/auth/v1/settings"),
        &[("apikey", instance.credentials.anon_key.as_str())],
    )
    .await;

    let token = sbo_allocator::derive_api_token(&instance.credentials.signing_secret, sbo_allocator::TokenRole::Anon);
    let jwt_round_trip_ok = sbo_allocator::verify_api_token(&instance.credentials.signing_secret, &token);

    let signup_status = client
        .post(format!("{base}/auth/v1/signup"))
        .header("apikey", instance.credentials.anon_key.as_str())
        .json(&json!({ "email": "probe-dummy@example.invalid", "password": "probe-dummy-password" }))
        .send()
        .await
        .ok()
        .map(|r| r.status().as_u16());
    let signup_ok = matches!(signup_status, Some(200) | Some(422));

    let checks_passed = [
        health.status.is_some_and(|s| s < 500),
        settings.status.is_some_and(|s| s < 500),
        jwt_round_trip_ok,
        signup_ok,
    ];
    let pass_count = checks_passed.iter().filter(|p| **p).count();

    let detail = json!({
        "health_status": health.status,
        "settings_status": settings.status,
        "jwt_round_trip_ok": jwt_round_trip_ok,
        "signup_status": signup_status,
        "checks_passed": pass_count,
        "checks_total": checks_passed.len(),
    });

    if pass_count == checks_passed.len() {
        healthy(detail)
    } else {
        unhealthy(detail, format!("{}/{} auth checks passed", pass_count, checks_passed.len()))
    }
}

// ─── Disk probe ────────────────────────────────────────────────────────────────

pub async fn probe_disk(instance: &Instance) -> ProbeOutcome {
    let volumes_dir = instance.docker.volumes_dir.clone();
    tokio::task::spawn_blocking(move || {
        let root = std::path::Path::new(&volumes_dir);
        if !root.is_dir() {
            return unhealthy(json!({ "path": volumes_dir }), "volumes directory missing");
        }
        let required = ["db", "storage", "logs"];
        let missing: Vec<&str> = required.iter().filter(|sub| !root.join(sub).is_dir()).copied().collect();
        let size_mb = dir_size_bytes(root) as f64 / (1024.0 * 1024.0);
        let detail = json!({ "path": volumes_dir, "size_mb": size_mb, "missing_subdirs": missing });

        if missing.is_empty() {
            healthy(detail)
        } else {
            unhealthy(detail, format!("missing subdirectories: {}", missing.join(", ")))
        }
    })
    .await
    .unwrap_or_else(|e| unhealthy(json!({}), e.to_string()))
}

fn dir_size_bytes(path: &std::path::Path) -> u64 {
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

// ─── Network probe ─────────────────────────────────────────────────────────────

pub async fn probe_network(instance: &Instance, timeout: Duration) -> ProbeOutcome {
    let ports = [
        ("gateway_http", instance.ports.gateway_http),
        ("database_external", instance.ports.database_external),
        ("analytics", instance.ports.analytics),
    ];

    let mut results = Vec::with_capacity(ports.len());
    for (name, port) in ports {
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
        let ok = tokio::time::timeout(timeout, connect).await.is_ok_and(|r| r.is_ok());
        results.push((name, ok));
    }

    let dns_ok = tokio::time::timeout(timeout, tokio::net::lookup_host("localhost:0")).await.is_ok_and(|r| r.is_ok());

    let detail = json!({
        "tcp": results.iter().map(|(name, ok)| json!({ "port_role": name, "reachable": ok })).collect::<Vec<_>>(),
        "dns_localhost_ok": dns_ok,
    });

    if results.iter().all(|(_, ok)| *ok) && dns_ok {
        healthy(detail)
    } else {
        let unreachable: Vec<&str> = results.iter().filter(|(_, ok)| !ok).map(|(n, _)| *n).collect();
        unhealthy(detail, format!("unreachable: {}, dns_ok={dns_ok}", unreachable.join(", ")))
    }
}

// ─── Log summary ────────────────────────────────────────────────────────────────

pub async fn probe_log_summary(
    driver: &dyn RuntimeDriver,
    target: &RuntimeTarget,
    tail_lines: usize,
    timeout: Duration,
) -> String {
    let mut summary = String::new();
    for name in &target.container_names {
        let Ok(text) = driver.logs(name, tail_lines, timeout).await else { continue };
        for line in text.lines() {
            let lower = line.to_ascii_lowercase();
            if lower.contains("error") || lower.contains("warn") {
                summary.push_str(name);
                summary.push_str(": ");
                summary.push_str(line);
                summary.push('\n');
            }
        }
    }
    summary
}

// ─── Critical-issue mapping (fixed, per probe kind) ────────────────────────────

fn critical_issue_for(probe_name: &str, message: &str) -> CriticalIssue {
    let (severity, category, hint) = match probe_name {
        "containers" => (Severity::Critical, ProbeCategory::Infrastructure, "restart the affected containers"),
        "database" => (
            Severity::Critical,
            ProbeCategory::Database,
            "restart the database container or regenerate credentials",
        ),
        "auth_service" => (Severity::Warning, ProbeCategory::Authentication, "restart the auth service"),
        "http_services" => (
            Severity::Warning,
            ProbeCategory::Services,
            "restart the rest, gateway, and storage containers",
        ),
        "network" => (Severity::Warning, ProbeCategory::Network, "check port connectivity and firewall rules"),
        _ => (Severity::Warning, ProbeCategory::Infrastructure, "inspect the volumes directory"),
    };
    CriticalIssue {
        severity,
        category,
        message: message.to_string(),
        resolution_hint: hint.to_string(),
    }
}

fn assemble(instance_id: &str, results: HashMap<String, ProbeOutcome>, recent_logs: String) -> Diagnostic {
    let overall_healthy = results.values().all(|r| r.healthy);
    let mut critical_issues: Vec<CriticalIssue> = results
        .iter()
        .filter(|(_, outcome)| !outcome.healthy)
        .map(|(name, outcome)| {
            critical_issue_for(name, outcome.error.as_deref().unwrap_or("probe reported unhealthy"))
        })
        .collect();
    critical_issues.sort_by_key(|i| i.category.priority());

    Diagnostic {
        timestamp: Utc::now(),
        instance_id: instance_id.to_string(),
        overall_healthy,
        results,
        critical_issues,
        recent_logs,
    }
}

/// Run every probe in parallel and assemble the full diagnostic report.
pub async fn run_full_diagnostic(
    driver: &dyn RuntimeDriver,
    instance: &Instance,
    target: &RuntimeTarget,
    timeouts: &ProbeTimeouts,
) -> Diagnostic {
    let (containers, http_services, database, auth_service, disk, network, recent_logs) = tokio::join!(
        probe_containers(driver, target, timeouts.containers),
        probe_http_services(instance, timeouts.http),
        probe_database(instance, timeouts.database),
        probe_auth_deep(instance, timeouts.http),
        probe_disk(instance),
        probe_network(instance, timeouts.network),
        probe_log_summary(driver, target, 200, timeouts.containers),
    );

    let results = HashMap::from([
        ("containers".to_string(), containers),
        ("http_services".to_string(), http_services),
        ("database".to_string(), database),
        ("auth_service".to_string(), auth_service),
        ("disk".to_string(), disk),
        ("network".to_string(), network),
    ]);

    assemble(&instance.id, results, recent_logs)
}

/// Container + HTTP + database probes only, used after a repair action to
/// cheaply re-check recovery.
pub async fn quick_health_check(
    driver: &dyn RuntimeDriver,
    instance: &Instance,
    target: &RuntimeTarget,
    timeouts: &ProbeTimeouts,
) -> Diagnostic {
    let (containers, http_services, database) = tokio::join!(
        probe_containers(driver, target, timeouts.containers),
        probe_http_services(instance, timeouts.http),
        probe_database(instance, timeouts.database),
    );

    let results = HashMap::from([
        ("containers".to_string(), containers),
        ("http_services".to_string(), http_services),
        ("database".to_string(), database),
    ]);

    assemble(&instance.id, results, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sbo_proto::{Credentials, DockerPaths, Instance, InstanceStatus, InstanceUrls, PortSet};
    use sbo_runtime::InMemoryDriver;

    fn test_instance() -> Instance {
        Instance {
            id: "i1".into(),
            name: "test".into(),
            organization: "acme".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: InstanceStatus::Running,
            ports: PortSet { gateway_http: 8101, gateway_https: 8401, database_external: 5501, analytics: 4101 },
            credentials: Credentials {
                database_password: "pw".into(),
                signing_secret: "a".repeat(64),
                anon_key: "anon".into(),
                service_role_key: "service".into(),
                dashboard_username: "admin".into(),
                dashboard_password: "pw".into(),
            },
            docker: DockerPaths {
                compose_file: "/tmp/nonexistent-compose.yml".into(),
                env_file: "/tmp/nonexistent.env".into(),
                volumes_dir: "/tmp/nonexistent-volumes".into(),
            },
            urls: InstanceUrls::derive("localhost", 8101),
            last_repair: None,
            last_diagnostic_at: None,
        }
    }

    #[tokio::test]
    async fn test_probe_containers_healthy_when_all_running() {
        let driver = InMemoryDriver::new();
        let target =
            RuntimeTarget { instance_id: "i1".into(), compose_file: String::new(), env_file: String::new(), container_names: vec!["db".into()] };
        driver.up(&target, Duration::from_secs(1)).await.unwrap();
        let outcome = probe_containers(&driver, &target, Duration::from_secs(1)).await;
        assert!(outcome.healthy);
    }

    #[tokio::test]
    async fn test_probe_containers_unhealthy_when_stopped() {
        let driver = InMemoryDriver::new();
        let target =
            RuntimeTarget { instance_id: "i1".into(), compose_file: String::new(), env_file: String::new(), container_names: vec!["db".into()] };
        let outcome = probe_containers(&driver, &target, Duration::from_secs(1)).await;
        assert!(!outcome.healthy);
    }

    #[tokio::test]
    async fn test_probe_disk_unhealthy_on_missing_directory() {
        let instance = test_instance();
        let outcome = probe_disk(&instance).await;
        assert!(!outcome.healthy);
    }

    #[tokio::test]
    async fn test_probe_disk_healthy_with_required_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["db", "storage", "logs"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }
        let mut instance = test_instance();
        instance.docker.volumes_dir = dir.path().to_string_lossy().into_owned();
        let outcome = probe_disk(&instance).await;
        assert!(outcome.healthy);
    }

    #[tokio::test]
    async fn test_probe_database_fails_soft_on_unreachable_host() {
        let instance = test_instance();
        let outcome = probe_database(&instance, Duration::from_millis(200)).await;
        assert!(!outcome.healthy);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_critical_issue_mapping_infrastructure_for_containers() {
        let issue = critical_issue_for("containers", "containers down");
        assert_eq!(issue.category, ProbeCategory::Infrastructure);
        assert_eq!(issue.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_run_full_diagnostic_unhealthy_when_driver_has_no_containers() {
        let driver = InMemoryDriver::new();
        let instance = test_instance();
        let target = RuntimeTarget {
            instance_id: instance.id.clone(),
            compose_file: instance.docker.compose_file.clone(),
            env_file: instance.docker.env_file.clone(),
            container_names: sbo_proto::EXPECTED_CONTAINERS
                .iter()
                .map(|r| sbo_proto::container_name(&instance.id, r))
                .collect(),
        };
        let diagnostic = run_full_diagnostic(&driver, &instance, &target, &ProbeTimeouts::default()).await;
        assert!(!diagnostic.overall_healthy);
        assert!(!diagnostic.critical_issues.is_empty());
        // infrastructure (containers) must sort before database per fixed priority
        assert_eq!(diagnostic.critical_issues[0].category, ProbeCategory::Infrastructure);
    }
}
