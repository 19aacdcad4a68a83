//! Environment-variable-driven configuration, loaded once at startup.
//!
//! Mirrors the node agent's `NodeConfig` shape (a plain struct with a
//! fallible `load()`) but reads from the process environment instead of a
//! JSON file, since this process has no persistent config file of its own —
//! every deployment knob here is meant to be set by whatever supervises the
//! container (systemd unit, compose file, k8s manifest).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingRequired(&'static str),
    #[error("environment variable {name} has an invalid value {value:?}: {reason}")]
    Invalid { name: &'static str, value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_root: PathBuf,
    pub external_host: String,
    pub max_instances: usize,
    pub docker_socket: String,
    pub create_timeout: Duration,
    pub repair_backup_retention: usize,
    pub diagnostic_cache_ttl: Duration,
    pub diagnostic_rate_limit: Duration,
    pub bind_addr: String,
    pub template_root: PathBuf,
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String> {
    lookup(name).ok_or(ConfigError::MissingRequired(name))
}

fn optional_parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T> {
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value, reason: "not a valid number".to_string() }),
        None => Ok(default),
    }
}

impl OrchestratorConfig {
    /// Load every documented environment input, applying defaults where
    /// the lineage's config loader would, and failing closed on the two
    /// inputs (`DATA_ROOT`, `EXTERNAL_HOST`) that have no safe default —
    /// per the design note, `EXTERNAL_HOST` in particular is never
    /// auto-detected since a wrong guess would hand out unreachable URLs.
    pub fn load() -> Result<Self> {
        Self::load_from(&|name| std::env::var(name).ok())
    }

    fn load_from(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_root = PathBuf::from(required(lookup, "DATA_ROOT")?);
        let external_host = required(lookup, "EXTERNAL_HOST")?;

        let max_instances = optional_parsed(lookup, "MAX_INSTANCES", 100usize)?;
        let docker_socket = lookup("DOCKER_SOCKET").unwrap_or_default();
        let create_timeout = Duration::from_secs(optional_parsed(lookup, "CREATE_TIMEOUT_SECONDS", 900u64)?);
        let repair_backup_retention = optional_parsed(lookup, "REPAIR_BACKUP_RETENTION", 5usize)?;
        let diagnostic_cache_ttl = Duration::from_secs(optional_parsed(lookup, "DIAGNOSTIC_CACHE_TTL_SECONDS", 300u64)?);
        let diagnostic_rate_limit = Duration::from_secs(optional_parsed(lookup, "DIAGNOSTIC_RATE_LIMIT_SECONDS", 120u64)?);
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string());
        let template_root = PathBuf::from(lookup("TEMPLATE_ROOT").unwrap_or_else(|| "./templates".to_string()));

        Ok(Self {
            data_root,
            external_host,
            max_instances,
            docker_socket,
            create_timeout,
            repair_backup_retention,
            diagnostic_cache_ttl,
            diagnostic_rate_limit,
            bind_addr,
            template_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_load_fails_without_required_vars() {
        let vars = HashMap::new();
        assert!(OrchestratorConfig::load_from(&lookup_from(&vars)).is_err());
    }

    #[test]
    fn test_load_applies_defaults() {
        let mut vars = HashMap::new();
        vars.insert("DATA_ROOT", "/tmp/sbo-data");
        vars.insert("EXTERNAL_HOST", "example.test");
        let config = OrchestratorConfig::load_from(&lookup_from(&vars)).unwrap();
        assert_eq!(config.max_instances, 100);
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.create_timeout, Duration::from_secs(900));
    }

    #[test]
    fn test_load_rejects_non_numeric_override() {
        let mut vars = HashMap::new();
        vars.insert("DATA_ROOT", "/tmp/sbo-data");
        vars.insert("EXTERNAL_HOST", "example.test");
        vars.insert("MAX_INSTANCES", "not-a-number");
        let err = OrchestratorConfig::load_from(&lookup_from(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MAX_INSTANCES", .. }));
    }
}
