//! Defines methods for interacting with the Consul Agent API.
//!
//! The sync engine only ever talks to the *local* agent, and only through
//! the handful of endpoints captured by the [`ConsulAgent`] trait. The
//! [`Agent`] struct is the HTTP implementation; tests substitute an
//! in-memory one.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::{http::Http, Config, Error, Result};

mod models;

pub use models::{AgentCheck, AgentService, CheckRegistration, ServiceRegistration, TtlStatus};

pub(crate) use models::format_duration;

/// The agent endpoints the sync engine drives.
///
/// Register calls are idempotent on the agent side: re-registering an
/// existing ID replaces its definition in place, which is what lets the
/// engine update a changed service without a deregister window.
#[async_trait]
pub trait ConsulAgent: Send + Sync {
    /// Returns all services registered with the local agent, keyed by
    /// service ID.
    async fn services(&self) -> Result<HashMap<String, AgentService>>;

    /// Returns all checks registered with the local agent, keyed by
    /// check ID.
    async fn checks(&self) -> Result<HashMap<String, AgentCheck>>;

    /// Adds a new service to the local agent, or replaces the definition
    /// of an existing one.
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Removes a service (and its attached checks) from the local agent.
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Adds a new check to the local agent, or replaces the definition of
    /// an existing one.
    async fn register_check(&self, registration: &CheckRegistration) -> Result<()>;

    /// Removes a check from the local agent.
    async fn deregister_check(&self, check_id: &str) -> Result<()>;

    /// Pushes the result of a hosted check through the agent's TTL
    /// update endpoint.
    async fn update_ttl(&self, check_id: &str, output: &str, status: TtlStatus) -> Result<()>;

    /// Reachability probe; the response body is discarded.
    async fn agent_self(&self) -> Result<()>;
}

/// The `Agent` struct is used to interact with the agent endpoint of the
/// Consul HTTP API.
pub struct Agent {
    client: Arc<reqwest::Client>,
    config: Arc<Config>,
}

impl Http for Agent {
    fn inner(&self) -> (&reqwest::Client, &Config) {
        (&self.client, &self.config)
    }
}

impl Agent {
    /// Create a new `Agent` from the given `Config`.
    ///
    /// This is the only place TLS material is consumed; a client that
    /// cannot be built here is fatal and the engine never starts.
    pub fn new(config: Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = token.parse().map_err(|_| Error::InvalidToken)?;
            headers.insert("X-Consul-Token", value);
        }
        let client = reqwest::Client::builder()
            .user_agent("consul-sync")
            .default_headers(headers)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            client: Arc::new(client),
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl ConsulAgent for Agent {
    /// <https://developer.hashicorp.com/consul/api-docs/agent/service#list-services>
    async fn services(&self) -> Result<HashMap<String, AgentService>> {
        self.get("agent/services").await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent/check#list-checks>
    async fn checks(&self) -> Result<HashMap<String, AgentCheck>> {
        self.get("agent/checks").await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent/service#register-service>
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        self.put("agent/service/register", registration).await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent/service#deregister-service>
    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.put_empty(&format!("agent/service/deregister/{}", service_id))
            .await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent/check#register-check>
    async fn register_check(&self, registration: &CheckRegistration) -> Result<()> {
        self.put("agent/check/register", registration).await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent/check#deregister-check>
    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        self.put_empty(&format!("agent/check/deregister/{}", check_id))
            .await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent/check#ttl-check-update>
    async fn update_ttl(&self, check_id: &str, output: &str, status: TtlStatus) -> Result<()> {
        let body = serde_json::json!({
            "Status": status,
            "Output": output,
        });
        self.put(&format!("agent/check/update/{}", check_id), &body)
            .await
    }

    /// <https://developer.hashicorp.com/consul/api-docs/agent#read-configuration>
    async fn agent_self(&self) -> Result<()> {
        self.get_discard("agent/self").await
    }
}
