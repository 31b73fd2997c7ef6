//! The reconciliation engine.
//!
//! A [`Syncer`] holds two inventories: the *desired* state, written by
//! producers through [`Syncer::set_services`], and the *tracked* state,
//! the engine's record of what it most recently registered with the
//! agent. A periodic loop flattens the desired state across all domains,
//! diffs it against the agent's inventory, and issues the registrations
//! and deregistrations needed to converge. Failures are aggregated and
//! retried implicitly: whatever did not apply this pass shows up in the
//! next diff.

mod diff;
mod ids;

pub use ids::{ServiceDomain, SERVICE_ID_PREFIX};

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::{
    sync::{watch, Notify},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    agent::{format_duration, Agent, CheckRegistration, ConsulAgent, ServiceRegistration},
    check::{Check, CheckRunner},
    workload::{AddrFinder, Service, ServiceCheck, CHECK_HTTP, CHECK_SCRIPT, CHECK_TCP},
    Config, Error, MultiError, Result,
};

/// Interval between reconciliation passes.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);
/// Divisor applied to [`SYNC_INTERVAL`] to bound the random stagger
/// subtracted from each rearm, so co-located engines do not thundering-herd
/// the agent.
pub const SYNC_JITTER_DIVISOR: u32 = 8;
/// Slack added on top of a delegated check's interval when deriving its
/// TTL, tolerating scheduling jitter in the runner.
pub const TTL_CHECK_BUFFER: Duration = Duration::from_secs(31);
/// How long an embedding process waits for the first sync to settle.
pub const INITIAL_SYNC_BUFFER: Duration = Duration::from_secs(30);
/// Delay between attempts while waiting out [`INITIAL_SYNC_BUFFER`].
pub const INITIAL_SYNC_DELAY: Duration = Duration::from_secs(5);

/// A named callback invoked before each sync pass. Handlers run in no
/// particular order.
type PeriodicHandler = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Builds the [`Check`] capability for a delegated check registration.
type CheckFactory = Box<dyn Fn(&ServiceCheck, &str) -> Result<Arc<dyn Check>> + Send + Sync>;

struct Delegation {
    kinds: HashSet<String>,
    factory: CheckFactory,
}

/// Desired state, per domain and service key. The services and checks of
/// a domain share one key space: checks are only carried for services
/// present under the same key.
#[derive(Default)]
struct Groups {
    services: HashMap<ServiceDomain, HashMap<String, ServiceRegistration>>,
    checks: HashMap<ServiceDomain, HashMap<String, Vec<CheckRegistration>>>,
}

/// What the engine believes the agent currently has, plus the runners
/// hosting delegated checks. Mutated only by the sync driver and by
/// shutdown.
#[derive(Default)]
struct Registry {
    services: HashMap<String, ServiceRegistration>,
    checks: HashMap<String, CheckRegistration>,
    runners: HashMap<String, Arc<CheckRunner>>,
}

/// Reconciles desired services and checks against the local Consul
/// agent.
///
/// All entry points take `&self`; the engine is shared behind an
/// [`Arc`] between producers, the periodic loop and the runners it
/// spawns.
pub struct Syncer {
    agent: Arc<dyn ConsulAgent>,
    groups: RwLock<Groups>,
    registry: RwLock<Registry>,
    periodic: Mutex<HashMap<String, PeriodicHandler>>,
    delegation: RwLock<Option<Delegation>>,
    addr_finder: RwLock<AddrFinder>,
    reachable: Arc<AtomicBool>,
    sync_signal: Notify,
    shutdown_requested: watch::Sender<bool>,
    shutdown_done: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Syncer {
    /// Creates an engine talking to the agent described by `config`.
    ///
    /// Fails only if the HTTP client cannot be constructed (bad TLS
    /// material, malformed token); nothing is sent to the agent yet.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_agent(Arc::new(Agent::new(config)?)))
    }

    /// Creates an engine over an existing agent implementation.
    pub fn with_agent(agent: Arc<dyn ConsulAgent>) -> Self {
        Self {
            agent,
            groups: RwLock::default(),
            registry: RwLock::default(),
            periodic: Mutex::new(HashMap::new()),
            delegation: RwLock::new(None),
            addr_finder: RwLock::new(Box::new(|_| (None, None))),
            reachable: Arc::new(AtomicBool::new(true)),
            sync_signal: Notify::new(),
            shutdown_requested: watch::channel(false).0,
            shutdown_done: watch::channel(false).0,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Installs the resolver mapping a producer's port label to the
    /// concrete address and port used in registrations.
    pub fn set_addr_finder(&self, finder: AddrFinder) {
        *self.addr_finder.write() = finder;
    }

    /// Declares which check kinds the engine executes itself rather than
    /// delegating to the agent, and the factory producing their
    /// [`Check`] capabilities.
    pub fn set_delegated_checks<I, F>(&self, kinds: I, factory: F)
    where
        I: IntoIterator<Item = String>,
        F: Fn(&ServiceCheck, &str) -> Result<Arc<dyn Check>> + Send + Sync + 'static,
    {
        *self.delegation.write() = Some(Delegation {
            kinds: kinds.into_iter().collect(),
            factory: Box::new(factory),
        });
    }

    /// Atomically replaces the desired services (and their checks) of one
    /// domain, then signals an immediate sync.
    ///
    /// `services` is keyed by service key (see
    /// [`generate_service_key`](crate::workload::generate_service_key)).
    /// Construction errors (unknown check kind, unbuildable URL, failed
    /// delegated-check factory) are aggregated and returned, but every
    /// entry that constructed cleanly is still applied.
    pub fn set_services(
        &self,
        domain: ServiceDomain,
        services: HashMap<String, Service>,
    ) -> Result<()> {
        let mut errs = MultiError::new();
        let mut service_group: HashMap<String, ServiceRegistration> = HashMap::new();
        let mut check_group: HashMap<String, Vec<CheckRegistration>> = HashMap::new();

        {
            let finder = self.addr_finder.read();
            let delegation = self.delegation.read();
            for (key, service) in &services {
                let id = ids::service_id(&domain, key);
                let (address, port) = (*finder)(&service.port_label);
                service_group.insert(
                    key.clone(),
                    ServiceRegistration {
                        id: id.clone(),
                        name: service.name.clone(),
                        tags: service.tags.clone(),
                        port,
                        address: address.filter(|a| !a.is_empty()),
                        enable_tag_override: service.enable_tag_override,
                    },
                );

                let mut registrations = Vec::with_capacity(service.checks.len());
                for check in &service.checks {
                    let check_id = ids::check_id(&id, check);
                    let label = if check.port_label.is_empty() {
                        &service.port_label
                    } else {
                        &check.port_label
                    };
                    let (check_address, check_port) = (*finder)(label);
                    let registration =
                        match check_registration(&check_id, &id, check, check_address, check_port) {
                            Ok(registration) => registration,
                            Err(err) => {
                                errs.push(err);
                                continue;
                            }
                        };
                    if let Some(delegation) = delegation
                        .as_ref()
                        .filter(|d| d.kinds.contains(&check.kind))
                    {
                        if let Err(err) = self.adopt_runner(&check_id, check, delegation) {
                            errs.push(err);
                            continue;
                        }
                    }
                    registrations.push(registration);
                }
                check_group.insert(key.clone(), registrations);
            }
        }

        let mut groups = self.groups.write();
        groups.services.insert(domain.clone(), service_group);
        groups.checks.insert(domain, check_group);
        drop(groups);

        self.sync_now();
        errs.into_result()
    }

    /// Creates (unstarted) the runner hosting a delegated check, unless
    /// one already exists for this check ID.
    fn adopt_runner(
        &self,
        check_id: &str,
        check: &ServiceCheck,
        delegation: &Delegation,
    ) -> Result<()> {
        if self.registry.read().runners.contains_key(check_id) {
            return Ok(());
        }
        let capability = (delegation.factory)(check, check_id)?;
        self.registry
            .write()
            .runners
            .insert(check_id.to_string(), Arc::new(CheckRunner::new(capability)));
        Ok(())
    }

    /// Deregisters every engine-owned service at the agent that does not
    /// belong to one of the given domains, regardless of tracked state.
    /// Desired state is not touched.
    pub async fn reap_unmatched(&self, domains: &[ServiceDomain]) -> Result<()> {
        let prefixes: Vec<String> = domains.iter().map(ids::domain_prefix).collect();
        let remote = self.agent.services().await?;
        let mut errs = MultiError::new();
        for id in remote.keys() {
            if !ids::is_engine_owned(id) {
                continue;
            }
            if prefixes.iter().any(|prefix| id.starts_with(prefix.as_str())) {
                continue;
            }
            debug!(service = %id, "reaping service outside any known domain");
            match self.agent.deregister_service(id).await {
                Ok(()) => {
                    self.registry.write().services.remove(id);
                }
                Err(err) => errs.push(err),
            }
        }
        errs.into_result()
    }

    /// Registers a uniquely named callback to run before each sync pass.
    /// Returns false (leaving the existing handler installed) if the name
    /// is taken.
    pub fn add_periodic_handler<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.periodic.lock();
        if handlers.contains_key(name) {
            debug!(handler = %name, "periodic handler already registered");
            return false;
        }
        handlers.insert(name.to_string(), Arc::new(handler));
        true
    }

    /// Removes a periodic handler by name.
    pub fn remove_periodic_handler(&self, name: &str) {
        self.periodic.lock().remove(name);
    }

    /// Number of installed periodic handlers.
    pub fn num_handlers(&self) -> usize {
        self.periodic.lock().len()
    }

    /// Requests a prompt sync from the periodic loop. The signal holds at
    /// most one pending wakeup, so bursts of producer updates collapse
    /// into a single extra pass.
    pub fn sync_now(&self) {
        self.sync_signal.notify_one();
    }

    /// Runs one full reconciliation pass: periodic handlers, then
    /// services, then checks (a check referencing a not-yet-registered
    /// service would be rejected by the agent).
    ///
    /// Errors from individual handlers and agent calls are aggregated;
    /// the pass keeps going. A failure to *query* the agent aborts the
    /// affected phase, and the next pass retries everything still
    /// pending.
    pub async fn sync_services(&self) -> Result<()> {
        let mut errs = MultiError::new();

        let handlers: Vec<(String, PeriodicHandler)> = {
            let handlers = self.periodic.lock();
            handlers
                .iter()
                .map(|(name, handler)| (name.clone(), handler.clone()))
                .collect()
        };
        for (name, handler) in handlers {
            if let Err(err) = handler() {
                errs.push(Error::Handler {
                    name,
                    source: Box::new(err),
                });
            }
        }

        if let Err(err) = self.sync_service_state().await {
            errs.push(err);
        }
        if let Err(err) = self.sync_check_state().await {
            errs.push(err);
        }

        let result = errs.into_result();
        if result.is_ok() {
            note_availability(&self.reachable, true);
        } else {
            // A failed pass may mean an unreachable agent or just a bad
            // item; let the self endpoint decide which.
            note_availability(&self.reachable, self.agent.agent_self().await.is_ok());
        }
        result
    }

    async fn sync_service_state(&self) -> Result<()> {
        let remote: HashMap<_, _> = self
            .agent
            .services()
            .await?
            .into_iter()
            .filter(|(id, _)| ids::is_engine_owned(id))
            .collect();
        let local = self.flattened_services();
        let diff = diff::diff_services(&local, &remote);
        debug!(
            missing = diff.missing.len(),
            equal = diff.equal.len(),
            changed = diff.changed.len(),
            stale = diff.stale.len(),
            "reconciling services"
        );

        let mut errs = MultiError::new();
        for registration in diff.missing.iter().chain(diff.changed.iter()) {
            match self.agent.register_service(registration).await {
                Ok(()) => {
                    self.registry
                        .write()
                        .services
                        .insert(registration.id.clone(), registration.clone());
                }
                Err(err) => errs.push(err),
            }
        }
        for id in &diff.stale {
            match self.agent.deregister_service(id).await {
                Ok(()) => {
                    self.registry.write().services.remove(id);
                }
                Err(err) => errs.push(err),
            }
        }
        errs.into_result()
    }

    async fn sync_check_state(&self) -> Result<()> {
        let remote: HashMap<_, _> = self
            .agent
            .checks()
            .await?
            .into_iter()
            .filter(|(_, check)| ids::is_engine_owned(&check.service_id))
            .collect();
        let local = self.flattened_checks();
        let diff = diff::diff_checks(&local, &remote);
        debug!(
            missing = diff.missing.len(),
            equal = diff.equal.len(),
            changed = diff.changed.len(),
            stale = diff.stale.len(),
            "reconciling checks"
        );

        let mut errs = MultiError::new();
        for registration in diff.missing.iter().chain(diff.changed.iter()) {
            match self.register_check(registration).await {
                Ok(()) => {
                    self.registry
                        .write()
                        .checks
                        .insert(registration.id.clone(), registration.clone());
                }
                Err(err) => errs.push(err),
            }
        }
        for id in &diff.stale {
            match self.deregister_check(id).await {
                Ok(()) => {
                    self.registry.write().checks.remove(id);
                }
                Err(err) => errs.push(err),
            }
        }

        // Runners die with their desired-state entry. The stale partition
        // misses checks the agent already dropped (deregistering a
        // service takes its checks with it), so prune against the local
        // view as well.
        let doomed: Vec<Arc<CheckRunner>> = {
            let mut registry = self.registry.write();
            let orphaned: Vec<String> = registry
                .runners
                .keys()
                .filter(|id| !local.contains_key(*id))
                .cloned()
                .collect();
            orphaned
                .iter()
                .filter_map(|id| registry.runners.remove(id))
                .collect()
        };
        for runner in doomed {
            runner.stop();
        }

        errs.into_result()
    }

    /// Registers one check with the agent, starting its delegated runner
    /// first so the TTL window opens with a runner behind it.
    async fn register_check(&self, registration: &CheckRegistration) -> Result<()> {
        let runner = self.registry.read().runners.get(&registration.id).cloned();
        if let Some(runner) = runner {
            runner.start(self.agent.clone(), self.reachable.clone());
        }
        self.agent.register_check(registration).await
    }

    /// Deregisters one check, stopping and discarding its runner.
    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        self.agent.deregister_check(check_id).await?;
        if let Some(runner) = self.registry.write().runners.remove(check_id) {
            runner.stop();
        }
        Ok(())
    }

    /// Snapshot of desired services across all domains, keyed by service
    /// ID. Built entirely under the groups lock, which is released before
    /// any agent call.
    fn flattened_services(&self) -> HashMap<String, ServiceRegistration> {
        let groups = self.groups.read();
        let mut services = HashMap::new();
        for group in groups.services.values() {
            for registration in group.values() {
                services.insert(registration.id.clone(), registration.clone());
            }
        }
        services
    }

    /// Snapshot of desired checks across all domains, keyed by check ID.
    fn flattened_checks(&self) -> HashMap<String, CheckRegistration> {
        let groups = self.groups.read();
        let mut checks = HashMap::new();
        for group in groups.checks.values() {
            for registrations in group.values() {
                for registration in registrations {
                    checks.insert(registration.id.clone(), registration.clone());
                }
            }
        }
        checks
    }

    /// Drives the periodic loop until shutdown.
    ///
    /// The first pass fires immediately; afterwards the timer rearms to
    /// [`SYNC_INTERVAL`] minus a random stagger. [`Syncer::sync_now`]
    /// pulls the next pass forward; an external shutdown signal routes
    /// through [`Syncer::shutdown`].
    pub async fn run(&self) {
        let mut requested = self.shutdown_requested.subscribe();
        let mut done = self.shutdown_done.subscribe();
        let mut deadline = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = done.changed() => {
                    info!("shutting down sync loop");
                    return;
                }
                _ = requested.changed() => {
                    if let Err(err) = self.shutdown().await {
                        warn!(error = %err, "shutdown completed with errors");
                    }
                }
                _ = self.sync_signal.notified() => {
                    deadline = Instant::now();
                }
                _ = sleep_until(deadline) => {
                    // Transitions are logged by note_availability; a
                    // failed pass is otherwise left to the next tick.
                    let _ = self.sync_services().await;
                    deadline = Instant::now() + jittered_interval();
                }
            }
        }
    }

    /// Asks the periodic loop to shut the engine down. Safe to call from
    /// any task; completion is observable through [`Syncer::shutdown`]'s
    /// own idempotence.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_requested.send(true);
    }

    /// Shuts the engine down: stops the periodic loop and every check
    /// runner, then best-effort deregisters all tracked services.
    /// Idempotent; later calls return `Ok` without doing anything.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_done.send(true);

        let runners: Vec<Arc<CheckRunner>> = {
            let mut registry = self.registry.write();
            registry.runners.drain().map(|(_, runner)| runner).collect()
        };
        for runner in runners {
            runner.stop();
        }

        let tracked: Vec<String> = self.registry.read().services.keys().cloned().collect();
        info!(services = tracked.len(), "deregistering tracked services");
        let mut errs = MultiError::new();
        for id in tracked {
            match self.agent.deregister_service(&id).await {
                Ok(()) => {
                    self.registry.write().services.remove(&id);
                }
                Err(err) => errs.push(err),
            }
        }
        errs.into_result()
    }
}

/// Records agent availability, logging only the transitions so a long
/// outage does not flood the log.
pub(crate) fn note_availability(flag: &AtomicBool, ok: bool) {
    let was = flag.swap(ok, Ordering::SeqCst);
    if was && !ok {
        warn!("lost contact with agent; sync will retry each tick");
    } else if !was && ok {
        info!("agent reachable again");
    }
}

/// [`SYNC_INTERVAL`] shortened by a random stagger of at most
/// `SYNC_INTERVAL / SYNC_JITTER_DIVISOR`.
fn jittered_interval() -> Duration {
    let stagger = rand::thread_rng().gen_range(Duration::ZERO..SYNC_INTERVAL / SYNC_JITTER_DIVISOR);
    SYNC_INTERVAL - stagger
}

/// Builds the agent registration for one producer check.
fn check_registration(
    check_id: &str,
    service_id: &str,
    check: &ServiceCheck,
    address: Option<String>,
    port: Option<u16>,
) -> Result<CheckRegistration> {
    let mut registration = CheckRegistration {
        id: check_id.to_string(),
        name: check.name.clone(),
        notes: check.notes.clone(),
        service_id: service_id.to_string(),
        ..Default::default()
    };
    match check.kind.as_str() {
        CHECK_HTTP => {
            let protocol = if check.protocol.is_empty() {
                "http"
            } else {
                check.protocol.as_str()
            };
            let assembled = format!(
                "{}://{}:{}{}",
                protocol,
                address.unwrap_or_default(),
                port.unwrap_or(0),
                check.path
            );
            // Validate only; Url's renderer would strip default ports.
            url::Url::parse(&assembled)?;
            registration.http = Some(assembled);
            registration.interval = Some(format_duration(check.interval));
            registration.timeout = Some(format_duration(check.timeout));
        }
        CHECK_TCP => {
            registration.tcp = Some(format!(
                "{}:{}",
                address.unwrap_or_default(),
                port.unwrap_or(0)
            ));
            registration.interval = Some(format_duration(check.interval));
            registration.timeout = Some(format_duration(check.timeout));
        }
        CHECK_SCRIPT => {
            registration.ttl = Some(format_duration(check.interval + TTL_CHECK_BUFFER));
        }
        other => return Err(Error::UnknownCheckKind(other.to_string())),
    }
    Ok(registration)
}
