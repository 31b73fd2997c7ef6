//! Producer-facing records.
//!
//! These are the service and check descriptions handed to the engine by
//! its producers (cluster server, node client, workload executors). They
//! describe intent; the engine turns them into agent registrations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Check kind polled by the agent over HTTP.
pub const CHECK_HTTP: &str = "http";
/// Check kind dialed by the agent over TCP.
pub const CHECK_TCP: &str = "tcp";
/// Check kind executed by this engine and reported via TTL updates.
pub const CHECK_SCRIPT: &str = "script";

/// A service a producer wants registered.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    /// Display name of the service.
    pub name: String,
    /// Tags attached to the service. Order is preserved in the
    /// registration and in the derived service key.
    pub tags: Vec<String>,
    /// Label resolved to `(address, port)` through the engine's address
    /// finder.
    pub port_label: String,
    /// Disables the agent's anti-entropy feature for this service's tags.
    pub enable_tag_override: bool,
    /// Health checks attached to the service.
    pub checks: Vec<ServiceCheck>,
}

/// A health check attached to a [`Service`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCheck {
    /// Display name of the check.
    pub name: String,
    /// One of [`CHECK_HTTP`], [`CHECK_TCP`] or [`CHECK_SCRIPT`]. Anything
    /// else is rejected during [`Syncer::set_services`].
    ///
    /// [`Syncer::set_services`]: crate::Syncer::set_services
    pub kind: String,
    /// How often the probe runs.
    pub interval: Duration,
    /// How long a single probe may take.
    pub timeout: Duration,
    /// Path polled by an HTTP check.
    pub path: String,
    /// URL scheme of an HTTP check; empty means `http`.
    pub protocol: String,
    /// Port label the check targets; empty means the owning service's
    /// label.
    pub port_label: String,
    /// Command executed by a script check. Opaque to the engine; the
    /// delegated check factory interprets it.
    pub script: String,
    /// Free-form notes carried into the agent registration.
    pub notes: String,
}

/// Derives the stable key of a service within its domain: the name alone,
/// or the name joined with its tags in producer order. Reordering tags
/// therefore changes the key (and the service ID), while the registered
/// tag *set* compares order-insensitively.
pub fn generate_service_key(service: &Service) -> String {
    if service.tags.is_empty() {
        service.name.clone()
    } else {
        format!("{}-{}", service.name, service.tags.join("-"))
    }
}

/// Resolves a producer's port label to the concrete `(address, port)` a
/// registration should carry. `None` components are omitted from the
/// registration.
pub type AddrFinder = Box<dyn Fn(&str) -> (Option<String>, Option<u16>) + Send + Sync>;
