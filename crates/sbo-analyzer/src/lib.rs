//! Problem Analyzer: a pure function from a [`Diagnostic`] to a
//! [`RepairPlan`]. No I/O, no mutation — every decision is a deterministic
//! function of the probe outcomes already captured in the report.

#![forbid(unsafe_code)]

use sbo_proto::{Action, Diagnostic, ProbeCategory, RepairPlan};
use serde_json::json;

/// Build the ordered, phase-grouped repair plan for an unhealthy diagnostic.
/// Returns an empty plan if every probe the mapping understands is healthy.
pub fn analyze(diagnostic: &Diagnostic) -> RepairPlan {
    let mut actions = Vec::new();

    if let Some(outcome) = diagnostic.results.get("containers") {
        if !outcome.healthy {
            actions.push(Action {
                action_type: "restart_containers".to_string(),
                description: "Restart unhealthy containers".to_string(),
                method: "restart_containers".to_string(),
                parameters: json!({}),
                category: ProbeCategory::Infrastructure,
                priority: ProbeCategory::Infrastructure.priority(),
                critical: true,
                estimated_seconds: 45,
                depends_on: ProbeCategory::Infrastructure.depends_on().to_vec(),
            });
        }
    }

    if let Some(outcome) = diagnostic.results.get("database") {
        if !outcome.healthy {
            let credential_error = outcome
                .error
                .as_deref()
                .map(|e| {
                    let lower = e.to_ascii_lowercase();
                    lower.contains("password") || lower.contains("authentication")
                })
                .unwrap_or(false);

            if credential_error {
                actions.push(Action {
                    action_type: "regenerate_credentials".to_string(),
                    description: "Regenerate database credentials".to_string(),
                    method: "regenerate_credentials".to_string(),
                    parameters: json!({}),
                    category: ProbeCategory::Database,
                    priority: ProbeCategory::Database.priority(),
                    critical: true,
                    estimated_seconds: 60,
                    depends_on: ProbeCategory::Database.depends_on().to_vec(),
                });
            } else {
                actions.push(Action {
                    action_type: "restart_database_container".to_string(),
                    description: "Restart the database container".to_string(),
                    method: "restart_database_container".to_string(),
                    parameters: json!({}),
                    category: ProbeCategory::Database,
                    priority: ProbeCategory::Database.priority(),
                    critical: true,
                    estimated_seconds: 90,
                    depends_on: ProbeCategory::Database.depends_on().to_vec(),
                });
            }
        }
    }

    if let Some(outcome) = diagnostic.results.get("network") {
        if !outcome.healthy {
            let failing_ports: Vec<String> = outcome
                .detail
                .get("tcp")
                .and_then(|v| v.as_array())
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.get("reachable").and_then(|r| r.as_bool()) == Some(false))
                        .filter_map(|e| e.get("port_role").and_then(|r| r.as_str()).map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            actions.push(Action {
                action_type: "fix_network_connectivity".to_string(),
                description: "Restore network connectivity for failing ports".to_string(),
                method: "fix_network_connectivity".to_string(),
                parameters: json!({ "failing_ports": failing_ports }),
                category: ProbeCategory::Network,
                priority: ProbeCategory::Network.priority(),
                critical: false,
                estimated_seconds: 30,
                depends_on: ProbeCategory::Network.depends_on().to_vec(),
            });
        }
    }

    if let Some(outcome) = diagnostic.results.get("auth_service") {
        if !outcome.healthy {
            actions.push(Action {
                action_type: "restart_auth_service".to_string(),
                description: "Restart the authentication service".to_string(),
                method: "restart_auth_service".to_string(),
                parameters: json!({}),
                category: ProbeCategory::Authentication,
                priority: ProbeCategory::Authentication.priority(),
                critical: false,
                estimated_seconds: 25,
                depends_on: ProbeCategory::Authentication.depends_on().to_vec(),
            });
        }
    }

    if let Some(outcome) = diagnostic.results.get("http_services") {
        if !outcome.healthy {
            actions.push(Action {
                action_type: "restart_http_services".to_string(),
                description: "Restart HTTP-facing services".to_string(),
                method: "restart_http_services".to_string(),
                parameters: json!({}),
                category: ProbeCategory::Services,
                priority: ProbeCategory::Services.priority(),
                critical: false,
                estimated_seconds: 25,
                depends_on: ProbeCategory::Services.depends_on().to_vec(),
            });
        }
    }

    actions.sort_by_key(|a| a.priority);

    let phases = group_into_phases(&actions);
    let total_estimated_seconds = actions.iter().map(|a| a.estimated_seconds).sum();
    let summary = build_summary(&actions);

    RepairPlan { actions, phases, total_estimated_seconds, summary }
}

fn group_into_phases(actions: &[Action]) -> Vec<(ProbeCategory, Vec<usize>)> {
    let mut phases: Vec<(ProbeCategory, Vec<usize>)> = Vec::new();
    for (idx, action) in actions.iter().enumerate() {
        match phases.iter_mut().find(|(cat, _)| *cat == action.category) {
            Some((_, indices)) => indices.push(idx),
            None => phases.push((action.category, vec![idx])),
        }
    }
    phases
}

fn build_summary(actions: &[Action]) -> String {
    if actions.is_empty() {
        return "no repair necessary".to_string();
    }
    let critical_count = actions.iter().filter(|a| a.critical).count();
    format!("{} action(s) planned, {} critical", actions.len(), critical_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sbo_proto::ProbeOutcome;
    use std::collections::HashMap;

    fn outcome(healthy: bool, error: Option<&str>) -> ProbeOutcome {
        ProbeOutcome { healthy, detail: json!({}), error: error.map(str::to_string) }
    }

    fn diagnostic_with(results: HashMap<String, ProbeOutcome>) -> Diagnostic {
        Diagnostic {
            timestamp: Utc::now(),
            instance_id: "i1".to_string(),
            overall_healthy: results.values().all(|o| o.healthy),
            results,
            critical_issues: vec![],
            recent_logs: String::new(),
        }
    }

    #[test]
    fn test_healthy_diagnostic_yields_empty_plan() {
        let results = HashMap::from([("containers".to_string(), outcome(true, None))]);
        let plan = analyze(&diagnostic_with(results));
        assert!(plan.is_empty());
        assert_eq!(plan.total_estimated_seconds, 0);
    }

    #[test]
    fn test_unhealthy_containers_produce_restart_action() {
        let results = HashMap::from([("containers".to_string(), outcome(false, None))]);
        let plan = analyze(&diagnostic_with(results));
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].method, "restart_containers");
        assert!(plan.actions[0].critical);
    }

    #[test]
    fn test_database_credential_error_regenerates_credentials() {
        let results = HashMap::from([(
            "database".to_string(),
            outcome(false, Some("password authentication failed for user postgres")),
        )]);
        let plan = analyze(&diagnostic_with(results));
        assert_eq!(plan.actions[0].method, "regenerate_credentials");
    }

    #[test]
    fn test_database_other_error_restarts_container() {
        let results = HashMap::from([("database".to_string(), outcome(false, Some("connection refused")))]);
        let plan = analyze(&diagnostic_with(results));
        assert_eq!(plan.actions[0].method, "restart_database_container");
    }

    #[test]
    fn test_actions_ordered_by_category_priority() {
        let results = HashMap::from([
            ("http_services".to_string(), outcome(false, None)),
            ("containers".to_string(), outcome(false, None)),
            ("database".to_string(), outcome(false, None)),
        ]);
        let plan = analyze(&diagnostic_with(results));
        let categories: Vec<ProbeCategory> = plan.actions.iter().map(|a| a.category).collect();
        assert_eq!(categories, vec![ProbeCategory::Infrastructure, ProbeCategory::Database, ProbeCategory::Services]);
    }

    #[test]
    fn test_phases_group_by_category() {
        let results = HashMap::from([
            ("containers".to_string(), outcome(false, None)),
            ("database".to_string(), outcome(false, None)),
        ]);
        let plan = analyze(&diagnostic_with(results));
        assert_eq!(plan.phases.len(), 2);
    }

    #[test]
    fn test_network_action_carries_failing_ports() {
        let mut network_outcome = outcome(false, None);
        network_outcome.detail = json!({
            "tcp": [
                { "port_role": "gateway_http", "reachable": false },
                { "port_role": "database_external", "reachable": true },
            ]
        });
        let results = HashMap::from([("network".to_string(), network_outcome)]);
        let plan = analyze(&diagnostic_with(results));
        let failing = plan.actions[0].parameters.get("failing_ports").unwrap();
        assert_eq!(failing, &json!(["gateway_http"]));
    }
}
