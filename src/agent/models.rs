//! Typed payloads for the agent endpoints the engine drives.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// A service registered with the local agent, as reported by the
/// [list services] endpoint.
///
/// [list services]: https://www.consul.io/api-docs/agent/service#list-services
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AgentService {
    /// Specifies the service ID. If this was not specified when the
    /// service was created, the value of the name field will be used.
    #[serde(rename = "ID")]
    pub id: String,
    /// The logical name of the service.
    #[serde(rename = "Service")]
    pub name: String,
    /// List of string values used to add service-level labels.
    pub tags: Vec<String>,
    /// The port on which the service is exposed.
    pub port: u16,
    /// The address on which the service is exposed.
    pub address: String,
    /// Determines if the anti-entropy feature for the service is enabled.
    pub enable_tag_override: bool,
}

/// A health check registered with the local agent, as reported by the
/// [list checks] endpoint.
///
/// [list checks]: https://www.consul.io/api-docs/agent/check#list-checks
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AgentCheck {
    /// The ID of the check within the agent.
    #[serde(rename = "CheckID")]
    pub check_id: String,
    /// The name of the check.
    pub name: String,
    /// The current status of the check.
    pub status: String,
    /// Notes attached to this check.
    pub notes: String,
    /// The ID of the service the check belongs to.
    #[serde(rename = "ServiceID")]
    pub service_id: String,
}

/// Defines the configuration of a service to be created. Used by the
/// [register service] endpoint.
///
/// [register service]: https://www.consul.io/api-docs/agent/service#register-service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceRegistration {
    /// Specifies a unique ID for this service. This must be unique per
    /// agent.
    #[serde(rename = "ID")]
    pub id: String,
    /// Specifies the logical name of the service.
    pub name: String,
    /// Specifies a list of tags to assign to the service.
    pub tags: Vec<String>,
    /// Specifies the port on which the service is exposed. Omitted when
    /// the producer's port label did not resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Specifies the address on which the service is exposed. Omitted
    /// when the producer's port label did not resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Specifies to disable the anti-entropy feature for this service's
    /// tags.
    pub enable_tag_override: bool,
}

/// Defines the configuration of a check to be created. Used by the
/// [register check] endpoint.
///
/// Exactly one of the probe fields (`http`, `tcp`, `ttl`) is set; the
/// engine populates `ttl` for the checks it runs itself.
///
/// [register check]: https://www.consul.io/api-docs/agent/check#register-check
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CheckRegistration {
    /// Specifies a unique ID for this check on the node.
    #[serde(rename = "ID")]
    pub id: String,
    /// Specifies the name of the check.
    pub name: String,
    /// Specifies arbitrary information for humans. This is not used by
    /// Consul internally.
    pub notes: String,
    /// The ID of the service the check is attached to.
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    /// URL polled by the agent for an HTTP check.
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    /// `host:port` dialed by the agent for a TCP check.
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    /// Time-to-live for a check whose status is pushed by this engine.
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// Specifies the frequency at which to run this check. Required for
    /// HTTP and TCP checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Specifies a timeout for outgoing connections in the case of an
    /// HTTP or TCP check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// The status reported through the [TTL check update] endpoint.
///
/// [TTL check update]: https://www.consul.io/api-docs/agent/check#ttl-check-update
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlStatus {
    Passing,
    Warning,
    Critical,
}

impl TtlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlStatus::Passing => "passing",
            TtlStatus::Warning => "warning",
            TtlStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for TtlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a duration the way the agent parses Go duration strings.
pub(crate) fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formats_whole_seconds() {
        assert_eq!(format_duration(Duration::from_secs(41)), "41s");
    }

    #[test]
    fn duration_formats_subsecond_as_millis() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn ttl_status_serializes_lowercase() {
        let status = serde_json::to_value(TtlStatus::Warning).unwrap();
        assert_eq!(status, serde_json::json!("warning"));
    }

    #[test]
    fn check_registration_emits_consul_field_names() {
        let reg = CheckRegistration {
            id: "abc123".to_string(),
            name: "web-alive".to_string(),
            service_id: "_nomad-client-web".to_string(),
            http: Some("http://127.0.0.1:8080/health".to_string()),
            interval: Some("10s".to_string()),
            timeout: Some("2s".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&reg).unwrap();
        assert_eq!(value["ID"], "abc123");
        assert_eq!(value["ServiceID"], "_nomad-client-web");
        assert_eq!(value["HTTP"], "http://127.0.0.1:8080/health");
        assert!(value.get("TCP").is_none());
        assert!(value.get("TTL").is_none());
    }

    #[test]
    fn agent_service_decodes_list_response() {
        let raw = serde_json::json!({
            "ID": "_nomad-server-nomad-rpc",
            "Service": "nomad",
            "Tags": ["rpc"],
            "Port": 4647,
            "Address": "1.2.3.4",
            "EnableTagOverride": false,
        });
        let service: AgentService = serde_json::from_value(raw).unwrap();
        assert_eq!(service.id, "_nomad-server-nomad-rpc");
        assert_eq!(service.name, "nomad");
        assert_eq!(service.port, 4647);
    }
}
