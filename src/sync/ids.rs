//! Identifier derivation for engine-owned services and checks.
//!
//! Service IDs are `{prefix}-{domain}-{service key}`; check IDs are a
//! content hash over the check's spec under its owning service ID, so
//! identical specs collapse to one check and any spec change produces a
//! fresh ID. External tooling filters on the prefix, so the grammar here
//! must stay stable across versions.

use std::fmt;

use md5::{Digest, Md5};

use crate::workload::ServiceCheck;

/// Prefix of every service ID owned by this engine. The engine never acts
/// on agent records without it.
pub const SERVICE_ID_PREFIX: &str = "_nomad";

/// Namespace partitioning desired state by producer, so producers do not
/// collide on service keys.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ServiceDomain {
    /// The cluster server component.
    Server,
    /// The node-local client component.
    Client,
    /// A per-workload executor, one domain per (allocation, task) pair.
    Executor { alloc_id: String, task: String },
}

impl fmt::Display for ServiceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceDomain::Server => f.write_str("server"),
            ServiceDomain::Client => f.write_str("client"),
            ServiceDomain::Executor { alloc_id, task } => {
                write!(f, "executor-{}-{}", alloc_id, task)
            }
        }
    }
}

/// `{prefix}-{domain}-{key}`.
pub(crate) fn service_id(domain: &ServiceDomain, key: &str) -> String {
    format!("{}-{}-{}", SERVICE_ID_PREFIX, domain, key)
}

/// `{prefix}-{domain}-`, the ownership prefix matched by [`reap`-style
/// filters](crate::Syncer::reap_unmatched).
pub(crate) fn domain_prefix(domain: &ServiceDomain) -> String {
    format!("{}-{}-", SERVICE_ID_PREFIX, domain)
}

/// Whether a service ID belongs to this engine.
pub(crate) fn is_engine_owned(service_id: &str) -> bool {
    service_id
        .strip_prefix(SERVICE_ID_PREFIX)
        .map_or(false, |rest| rest.starts_with('-'))
}

/// Content hash identifying a check under its owning service.
///
/// Only the fields listed here participate, in this order; adding fields
/// to [`ServiceCheck`] must not shift existing IDs.
pub(crate) fn check_id(service_id: &str, check: &ServiceCheck) -> String {
    let mut hash = Md5::new();
    for part in [
        service_id,
        &check.name,
        &check.kind,
        &check.path,
        &check.protocol,
        &check.port_label,
    ] {
        hash.update(part.as_bytes());
        hash.update([0u8]);
    }
    hash.update(check.interval.as_nanos().to_le_bytes());
    hash.update(check.timeout.as_nanos().to_le_bytes());
    const_hex::encode(hash.finalize())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn web_check() -> ServiceCheck {
        ServiceCheck {
            name: "alive".to_string(),
            kind: "http".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            path: "/health".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn domains_render_their_namespace() {
        assert_eq!(ServiceDomain::Server.to_string(), "server");
        assert_eq!(ServiceDomain::Client.to_string(), "client");
        let executor = ServiceDomain::Executor {
            alloc_id: "a1".to_string(),
            task: "web".to_string(),
        };
        assert_eq!(executor.to_string(), "executor-a1-web");
    }

    #[test]
    fn service_ids_carry_the_prefix() {
        let id = service_id(&ServiceDomain::Server, "nomad-rpc-serf");
        assert_eq!(id, "_nomad-server-nomad-rpc-serf");
        assert!(is_engine_owned(&id));
        assert!(!is_engine_owned("web"));
        assert!(!is_engine_owned("_nomadish-server-x"));
    }

    #[test]
    fn identical_specs_collapse_to_one_id() {
        let a = check_id("_nomad-client-web", &web_check());
        let b = check_id("_nomad-client-web", &web_check());
        assert_eq!(a, b);
    }

    #[test]
    fn id_depends_on_owning_service() {
        let a = check_id("_nomad-client-web", &web_check());
        let b = check_id("_nomad-client-api", &web_check());
        assert_ne!(a, b);
    }

    #[test]
    fn id_changes_when_the_spec_changes() {
        let a = check_id("_nomad-client-web", &web_check());
        let mut changed = web_check();
        changed.interval = Duration::from_secs(30);
        let b = check_id("_nomad-client-web", &changed);
        assert_ne!(a, b);
    }

    #[test]
    fn unhashed_fields_do_not_shift_ids() {
        let a = check_id("_nomad-client-web", &web_check());
        let mut annotated = web_check();
        annotated.notes = "checked by ops".to_string();
        annotated.script = "/bin/true".to_string();
        let b = check_id("_nomad-client-web", &annotated);
        assert_eq!(a, b);
    }
}
