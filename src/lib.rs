//! # consul-sync
//!
//! An asynchronous reconciliation engine that keeps a locally owned
//! inventory of services and health checks in agreement with a co-located
//! [Consul](https://www.consul.io/docs) agent, reachable over its
//! [HTTP API](https://developer.hashicorp.com/consul/api-docs).
//!
//! ## Overview
//!
//! An orchestrator knows which services and checks should exist; the
//! Consul agent knows which ones do. This crate owns the gap between the
//! two. Producers (a cluster server, a node client, per-workload
//! executors) each publish their desired services into their own domain
//! with [`Syncer::set_services`], and a periodic loop diffs the flattened
//! desired state against the agent's inventory, issuing registrations and
//! deregistrations until the two agree.
//!
//! The engine also hosts *delegated* checks: health probes it executes
//! itself, reporting each result to the agent as a TTL status update. See
//! the [`check`] module for the probe contract.
//!
//! ## Usage
//!
//! Add the following to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! consul-sync = "0.1"
//! ```
//!
//! Construct a [`Syncer`] from a [`Config`], hand it desired services,
//! and drive it:
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use consul_sync::{Config, ServiceDomain, Syncer};
//!
//! # async fn example() -> consul_sync::Result<()> {
//! let syncer = Arc::new(Syncer::new(Config::default())?);
//! syncer.set_services(ServiceDomain::Server, HashMap::new())?;
//! let loop_task = {
//!     let syncer = syncer.clone();
//!     tokio::spawn(async move { syncer.run().await })
//! };
//! // ... later ...
//! syncer.shutdown().await?;
//! loop_task.await.unwrap();
//! # Ok(())
//! # }
//! ```
//!
//! The engine is not authoritative: it never reads agent state back as
//! truth and it does not persist desired state across restarts. Callers
//! see a mutation take effect no later than the next successful sync
//! pass.

use std::{env, fmt, time::Duration};

pub mod agent;
pub mod check;
mod http;
pub mod sync;
pub mod workload;

pub use agent::{
    Agent, AgentCheck, AgentService, CheckRegistration, ConsulAgent, ServiceRegistration,
    TtlStatus,
};
pub use check::{Check, CheckResult};
pub use sync::{
    ServiceDomain, Syncer, INITIAL_SYNC_BUFFER, INITIAL_SYNC_DELAY, SERVICE_ID_PREFIX,
    SYNC_INTERVAL, SYNC_JITTER_DIVISOR, TTL_CHECK_BUFFER,
};
pub use workload::{generate_service_key, AddrFinder, Service, ServiceCheck};

/// Type alias for `Result` with the error type `consul_sync::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// An enumeration of errors that can occur while reconciling with the
/// Consul agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error occured in the HTTP client.
    #[error("An error occured in the HTTP client")]
    Http(#[from] reqwest::Error),
    /// The agent answered with a non-success status code.
    #[error("Agent returned {status}: {body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    /// The specified envioronment variable was not found.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    /// The access token could not be encoded as a header value.
    #[error("Invalid access token")]
    InvalidToken,
    /// A producer supplied a check whose kind the engine does not know.
    #[error("Unknown check kind: {0:?}")]
    UnknownCheckKind(String),
    /// An HTTP check's assembled URL did not parse.
    #[error("Invalid check URL")]
    InvalidCheckUrl(#[from] url::ParseError),
    /// A periodic handler reported failure; the sync pass continued.
    #[error("Periodic handler {name:?} failed")]
    Handler {
        name: String,
        #[source]
        source: Box<Error>,
    },
    /// Several independent failures, collected from one operation.
    #[error(transparent)]
    Multiple(#[from] MultiError),
}

/// An aggregate of errors collected across the items of one operation.
///
/// Sync passes and shutdown touch many agent records and do not stop at
/// the first failure; everything that went wrong is gathered here and
/// returned once.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Collapses the aggregate: no errors is `Ok`, a single error is
    /// returned bare, anything more stays wrapped.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n* {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Configuration for the HTTP client used to reach the agent.
#[derive(Clone, Debug)]
pub struct Config {
    /// The address of the Consul agent. This is the address that the
    /// engine will connect to when making requests to the Consul HTTP
    /// API.
    pub address: String,
    /// The access token to use when making requests to the Consul HTTP
    /// API, sent as the `X-Consul-Token` header.
    pub token: Option<String>,
    /// Optional HTTP basic auth credentials, as `(username, password)`.
    pub auth: Option<(String, String)>,
    /// Per-request timeout. Every suspension point of the engine is
    /// bounded by this.
    pub timeout: Duration,
    /// When false, certificate verification is disabled on the client.
    pub verify_tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            auth: None,
            timeout: Duration::from_secs(30),
            verify_tls: true,
        }
    }
}

impl Config {
    /// Manually create a new `Config` for the agent at the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Create a new `Config` from environment variables. This reads the
    /// `CONSUL_HTTP_ADDR` and `CONSUL_HTTP_TOKEN` environment variables,
    /// as specified in the [Consul HTTP API documentation][1]
    ///
    /// [1]: https://developer.hashicorp.com/consul/api-docs
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            address: env::var("CONSUL_HTTP_ADDR")
                .map_err(|_| Error::MissingEnvVar("CONSUL_HTTP_ADDR".to_string()))?,
            token: env::var("CONSUL_HTTP_TOKEN").ok(),
            ..Self::default()
        })
    }
}
