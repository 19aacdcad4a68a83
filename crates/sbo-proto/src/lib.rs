//! Core data model for the Supabase instance orchestrator.
//!
//! Defines the types shared across the allocator, registry, config renderer,
//! runtime driver, health checker, repair engine, and backup component:
//! an `Instance` and the records it owns, plus the diagnostic and repair
//! types produced while supervising it.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Port ranges ──────────────────────────────────────────────────────────────

/// Inclusive `[low, high]` host-port range for one logical port role.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub const fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }
}

pub const GATEWAY_HTTP_RANGE: PortRange = PortRange::new(8100, 8199);
pub const GATEWAY_HTTPS_RANGE: PortRange = PortRange::new(8400, 8499);
pub const DATABASE_EXTERNAL_RANGE: PortRange = PortRange::new(5500, 5599);
pub const ANALYTICS_RANGE: PortRange = PortRange::new(4100, 4199);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    GatewayHttp,
    GatewayHttps,
    DatabaseExternal,
    Analytics,
}

impl PortRole {
    pub fn range(self) -> PortRange {
        match self {
            Self::GatewayHttp => GATEWAY_HTTP_RANGE,
            Self::GatewayHttps => GATEWAY_HTTPS_RANGE,
            Self::DatabaseExternal => DATABASE_EXTERNAL_RANGE,
            Self::Analytics => ANALYTICS_RANGE,
        }
    }
}

/// The set of host ports owned by one instance. Every field must be unique
/// across all live instances and fall within its role's declared range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortSet {
    pub gateway_http: u16,
    pub gateway_https: u16,
    pub database_external: u16,
    pub analytics: u16,
}

impl PortSet {
    /// All four ports as `(role, port)` pairs, for uniqueness/range checks.
    pub fn entries(&self) -> [(PortRole, u16); 4] {
        [
            (PortRole::GatewayHttp, self.gateway_http),
            (PortRole::GatewayHttps, self.gateway_https),
            (PortRole::DatabaseExternal, self.database_external),
            (PortRole::Analytics, self.analytics),
        ]
    }

    /// `true` iff every port lies within its role's declared range.
    pub fn within_declared_ranges(&self) -> bool {
        self.entries().iter().all(|(role, port)| role.range().contains(*port))
    }

    /// `true` iff `self` and `other` share no port value.
    pub fn disjoint(&self, other: &PortSet) -> bool {
        self.entries().iter().all(|(_, p)| {
            other.entries().iter().all(|(_, q)| p != q)
        })
    }
}

// ─── Credentials ──────────────────────────────────────────────────────────────

/// Generated, per-instance secret material. Never shared across instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub database_password: String,
    pub signing_secret: String,
    pub anon_key: String,
    pub service_role_key: String,
    pub dashboard_username: String,
    pub dashboard_password: String,
}

// ─── Docker / rendered artifacts ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerPaths {
    pub compose_file: String,
    pub env_file: String,
    pub volumes_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceUrls {
    pub api: String,
    pub studio: String,
}

impl InstanceUrls {
    pub fn derive(external_host: &str, gateway_http: u16) -> Self {
        let base = format!("http://{external_host}:{gateway_http}");
        Self {
            api: base.clone(),
            studio: base,
        }
    }
}

// ─── Instance ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
    Repairing,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Repairing => "repairing",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub organization: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: InstanceStatus,
    pub ports: PortSet,
    pub credentials: Credentials,
    pub docker: DockerPaths,
    pub urls: InstanceUrls,
    pub last_repair: Option<DateTime<Utc>>,
    pub last_diagnostic_at: Option<DateTime<Utc>>,
}

/// The seven containers every instance owns, named by convention from the
/// instance id. The Runtime Driver is the sole source of truth for their
/// live state; this list is just the naming convention.
pub const EXPECTED_CONTAINERS: [&str; 7] = [
    "db", "auth", "rest", "gateway", "storage", "realtime", "studio",
];

pub fn container_name(instance_id: &str, role: &str) -> String {
    format!("supabase-{instance_id}-{role}")
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// `name` must be non-empty, ≤ 64 chars, and match `[A-Za-z0-9_-]+`.
pub fn validate_instance_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ─── Diagnostic types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCategory {
    Infrastructure,
    Database,
    Network,
    Authentication,
    Services,
    Validation,
}

impl ProbeCategory {
    /// Categories this one depends on, per the Problem Analyzer's fixed
    /// dependency table.
    pub fn depends_on(self) -> &'static [ProbeCategory] {
        use ProbeCategory::*;
        match self {
            Infrastructure => &[],
            Database => &[Infrastructure],
            Network => &[Infrastructure],
            Authentication => &[Infrastructure, Database],
            Services => &[Infrastructure, Database, Network],
            Validation => &[Infrastructure, Database, Network, Authentication, Services],
        }
    }

    /// Fixed execution priority, lower runs first.
    pub fn priority(self) -> u8 {
        use ProbeCategory::*;
        match self {
            Infrastructure => 1,
            Database => 2,
            Network => 3,
            Authentication => 4,
            Services => 5,
            Validation => 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalIssue {
    pub severity: Severity,
    pub category: ProbeCategory,
    pub message: String,
    pub resolution_hint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub detail: serde_json::Value,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub overall_healthy: bool,
    pub results: std::collections::HashMap<String, ProbeOutcome>,
    pub critical_issues: Vec<CriticalIssue>,
    pub recent_logs: String,
}

// ─── Repair plan types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_type: String,
    pub description: String,
    pub method: String,
    pub parameters: serde_json::Value,
    pub category: ProbeCategory,
    pub priority: u8,
    pub critical: bool,
    pub estimated_seconds: u32,
    pub depends_on: Vec<ProbeCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairPlan {
    pub actions: Vec<Action>,
    pub phases: Vec<(ProbeCategory, Vec<usize>)>,
    pub total_estimated_seconds: u32,
    pub summary: String,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ─── Backup types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupComponent {
    pub success: bool,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub backup_id: String,
    pub instance_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub components: std::collections::HashMap<String, BackupComponent>,
    pub size_mb: f64,
    pub previous_manifest_hash: String,
    pub manifest_hash: String,
}

// ─── Shared error-kind taxonomy (§7) ──────────────────────────────────────────

/// Category-level error kind shared across crate boundaries so the HTTP
/// surface can map errors to status codes with one exhaustive match instead
/// of per-handler logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    Validation,
    Capacity,
    Concurrency,
    Runtime,
    Io,
    Repair,
    Backup,
}

impl ErrorKind {
    /// The HTTP status this category maps to, per §7's propagation policy.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Concurrency => 409,
            Self::Capacity => 503,
            Self::Runtime | Self::Io | Self::Repair | Self::Backup => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_instance_name() {
        assert!(validate_instance_name("alpha"));
        assert!(validate_instance_name("acme-project_1"));
        assert!(!validate_instance_name(""));
        assert!(!validate_instance_name("has spaces"));
        assert!(!validate_instance_name(&"x".repeat(65)));
    }

    #[test]
    fn test_port_set_disjoint() {
        let a = PortSet { gateway_http: 8100, gateway_https: 8400, database_external: 5500, analytics: 4100 };
        let b = PortSet { gateway_http: 8101, gateway_https: 8401, database_external: 5501, analytics: 4101 };
        assert!(a.disjoint(&b));
        assert!(!a.disjoint(&a));
    }

    #[test]
    fn test_port_set_within_ranges() {
        let good = PortSet { gateway_http: 8150, gateway_https: 8450, database_external: 5550, analytics: 4150 };
        assert!(good.within_declared_ranges());

        let bad = PortSet { gateway_http: 9000, gateway_https: 8450, database_external: 5550, analytics: 4150 };
        assert!(!bad.within_declared_ranges());
    }

    #[test]
    fn test_category_dependencies() {
        assert_eq!(ProbeCategory::Infrastructure.depends_on(), &[] as &[ProbeCategory]);
        assert_eq!(
            ProbeCategory::Authentication.depends_on(),
            &[ProbeCategory::Infrastructure, ProbeCategory::Database]
        );
    }

    #[test]
    fn test_error_kind_http_status() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Concurrency.http_status(), 409);
        assert_eq!(ErrorKind::Capacity.http_status(), 503);
        assert_eq!(ErrorKind::Runtime.http_status(), 500);
    }

    #[test]
    fn test_instance_status_display() {
        assert_eq!(InstanceStatus::Running.to_string(), "running");
        assert_eq!(InstanceStatus::Repairing.to_string(), "repairing");
    }
}
