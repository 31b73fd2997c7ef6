//! Four-way comparison between the flattened desired state and the
//! agent's inventory.
//!
//! Services and checks diff independently. Each side is keyed by opaque
//! ID; the result partitions the union of IDs into `missing` (register),
//! `equal` (leave alone), `changed` (re-register in place, no deregister
//! window) and `stale` (deregister). An agent record whose ID the local
//! view has never seen still lands in `stale`, which is what cleans up
//! leftovers from a previous incarnation of the engine.

use std::collections::HashMap;

use crate::agent::{AgentCheck, AgentService, CheckRegistration, ServiceRegistration};

#[derive(Debug, Default)]
pub(crate) struct ServiceDiff {
    pub missing: Vec<ServiceRegistration>,
    pub equal: Vec<String>,
    pub changed: Vec<ServiceRegistration>,
    pub stale: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct CheckDiff {
    pub missing: Vec<CheckRegistration>,
    pub equal: Vec<String>,
    pub changed: Vec<CheckRegistration>,
    pub stale: Vec<String>,
}

pub(crate) fn diff_services(
    local: &HashMap<String, ServiceRegistration>,
    remote: &HashMap<String, AgentService>,
) -> ServiceDiff {
    let mut diff = ServiceDiff::default();
    for (id, registration) in local {
        match remote.get(id) {
            None => diff.missing.push(registration.clone()),
            Some(existing) if services_equal(registration, existing) => diff.equal.push(id.clone()),
            Some(_) => diff.changed.push(registration.clone()),
        }
    }
    for id in remote.keys() {
        if !local.contains_key(id) {
            diff.stale.push(id.clone());
        }
    }
    diff
}

pub(crate) fn diff_checks(
    local: &HashMap<String, CheckRegistration>,
    remote: &HashMap<String, AgentCheck>,
) -> CheckDiff {
    let mut diff = CheckDiff::default();
    for (id, registration) in local {
        match remote.get(id) {
            None => diff.missing.push(registration.clone()),
            Some(existing) if checks_equal(registration, existing) => diff.equal.push(id.clone()),
            Some(_) => diff.changed.push(registration.clone()),
        }
    }
    for id in remote.keys() {
        if !local.contains_key(id) {
            diff.stale.push(id.clone());
        }
    }
    diff
}

fn services_equal(registration: &ServiceRegistration, existing: &AgentService) -> bool {
    registration.id == existing.id
        && registration.name == existing.name
        && registration.port.unwrap_or(0) == existing.port
        && registration.address.as_deref().unwrap_or_default() == existing.address
        && registration.enable_tag_override == existing.enable_tag_override
        && tags_equal(&registration.tags, &existing.tags)
}

/// Check equality deliberately ignores probe parameters: re-registering a
/// TTL check to change its interval would reset its TTL window, and any
/// real spec change moves the content-hashed ID instead.
fn checks_equal(registration: &CheckRegistration, existing: &AgentCheck) -> bool {
    registration.id == existing.check_id
        && registration.name == existing.name
        && registration.notes == existing.notes
        && registration.service_id == existing.service_id
}

/// Multiset equality: order-insensitive, duplicates counted.
fn tags_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut counts: HashMap<&str, isize> = HashMap::new();
    for tag in a {
        *counts.entry(tag.as_str()).or_default() += 1;
    }
    for tag in b {
        match counts.get_mut(tag.as_str()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str, tags: &[&str]) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: "web".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            port: Some(8080),
            address: Some("1.2.3.4".to_string()),
            enable_tag_override: false,
        }
    }

    fn agent_service(id: &str, tags: &[&str]) -> AgentService {
        AgentService {
            id: id.to_string(),
            name: "web".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            port: 8080,
            address: "1.2.3.4".to_string(),
            enable_tag_override: false,
        }
    }

    #[test]
    fn partitions_are_disjoint_and_complete() {
        let local = HashMap::from([
            ("a".to_string(), registration("a", &[])),
            ("b".to_string(), registration("b", &[])),
            ("c".to_string(), registration("c", &[])),
        ]);
        let mut changed = agent_service("b", &[]);
        changed.port = 9999;
        let remote = HashMap::from([
            ("a".to_string(), agent_service("a", &[])),
            ("b".to_string(), changed),
            ("d".to_string(), agent_service("d", &[])),
        ]);

        let diff = diff_services(&local, &remote);
        assert_eq!(
            diff.missing.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
        assert_eq!(diff.equal, vec!["a".to_string()]);
        assert_eq!(
            diff.changed.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
        assert_eq!(diff.stale, vec!["d".to_string()]);
    }

    #[test]
    fn tag_order_does_not_make_services_unequal() {
        let local = HashMap::from([("a".to_string(), registration("a", &["x", "y"]))]);
        let remote = HashMap::from([("a".to_string(), agent_service("a", &["y", "x"]))]);
        let diff = diff_services(&local, &remote);
        assert!(diff.missing.is_empty());
        assert!(diff.changed.is_empty());
        assert_eq!(diff.equal, vec!["a".to_string()]);
    }

    #[test]
    fn tag_duplicates_are_counted() {
        assert!(!tags_equal(
            &["x".to_string(), "x".to_string(), "y".to_string()],
            &["x".to_string(), "y".to_string(), "y".to_string()],
        ));
        assert!(tags_equal(
            &["x".to_string(), "x".to_string()],
            &["x".to_string(), "x".to_string()],
        ));
    }

    #[test]
    fn check_probe_parameters_do_not_trigger_reregistration() {
        let local = HashMap::from([(
            "abc".to_string(),
            CheckRegistration {
                id: "abc".to_string(),
                name: "alive".to_string(),
                service_id: "_nomad-client-web".to_string(),
                ttl: Some("41s".to_string()),
                ..Default::default()
            },
        )]);
        let remote = HashMap::from([(
            "abc".to_string(),
            AgentCheck {
                check_id: "abc".to_string(),
                name: "alive".to_string(),
                status: "passing".to_string(),
                service_id: "_nomad-client-web".to_string(),
                ..Default::default()
            },
        )]);
        let diff = diff_checks(&local, &remote);
        assert_eq!(diff.equal, vec!["abc".to_string()]);
        assert!(diff.changed.is_empty());
    }
}
