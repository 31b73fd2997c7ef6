//! Delegated health checks.
//!
//! Some checks are not probed by the agent at all: the engine runs them
//! itself and pushes each outcome through the agent's TTL update
//! endpoint. The [`Check`] trait is the capability the engine hosts; how
//! a probe actually runs (script, in-process, anything) is the caller's
//! business. One [`CheckRunner`] task exists per registered delegated
//! check and lives exactly as long as the registration does.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::agent::{ConsulAgent, TtlStatus};
use crate::sync::note_availability;

/// The outcome of a single probe run.
#[derive(Clone, Debug, Default)]
pub struct CheckResult {
    /// Process-style exit code: 0 passing, 1 warning, anything else
    /// critical.
    pub exit_code: i32,
    /// Captured probe output, forwarded to the agent verbatim.
    pub output: String,
    /// Set when the probe itself failed to run; reported as critical
    /// with this message as the output.
    pub err: Option<String>,
    /// How long the run took.
    pub duration: Duration,
}

/// A health probe the engine executes on behalf of the agent.
#[async_trait]
pub trait Check: Send + Sync {
    /// The check ID this probe reports under.
    fn id(&self) -> String;

    /// How often the probe runs.
    fn interval(&self) -> Duration;

    /// How long a single run may take before it is flagged.
    fn timeout(&self) -> Duration;

    /// Executes the probe once.
    async fn run(&self) -> CheckResult;
}

/// Translates a probe outcome into the status and output reported to the
/// agent.
pub(crate) fn translate_result(result: &CheckResult) -> (TtlStatus, String) {
    if let Some(err) = &result.err {
        return (TtlStatus::Critical, err.clone());
    }
    let status = match result.exit_code {
        0 => TtlStatus::Passing,
        1 => TtlStatus::Warning,
        _ => TtlStatus::Critical,
    };
    (status, result.output.clone())
}

/// Owns the background task executing one delegated check.
///
/// Created (unstarted) when the check enters desired state, started the
/// first time the sync driver presents the check to the agent, stopped at
/// deregistration or engine shutdown.
pub(crate) struct CheckRunner {
    check: Arc<dyn Check>,
    stop: watch::Sender<bool>,
    started: AtomicBool,
}

impl CheckRunner {
    pub(crate) fn new(check: Arc<dyn Check>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            check,
            stop,
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the runner task. Subsequent calls are no-ops.
    pub(crate) fn start(&self, agent: Arc<dyn ConsulAgent>, reachable: Arc<AtomicBool>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let check = self.check.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let id = check.id();
            debug!(check = %id, "starting delegated check");
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(check.interval()) => {}
                }
                let result = check.run().await;
                if result.duration >= check.timeout() {
                    warn!(
                        check = %id,
                        duration = ?result.duration,
                        timeout = ?check.timeout(),
                        "check exceeded its timeout"
                    );
                }
                let (status, output) = translate_result(&result);
                match agent.update_ttl(&id, &output, status).await {
                    Ok(()) => note_availability(&reachable, true),
                    Err(err) => {
                        note_availability(&reachable, false);
                        debug!(check = %id, error = %err, "failed to push check status");
                    }
                }
            }
            debug!(check = %id, "stopped delegated check");
        });
    }

    /// Signals the runner task to exit after its current iteration.
    pub(crate) fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32) -> CheckResult {
        CheckResult {
            exit_code,
            output: "probe output".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn exit_codes_map_to_statuses() {
        assert_eq!(translate_result(&result(0)).0, TtlStatus::Passing);
        assert_eq!(translate_result(&result(1)).0, TtlStatus::Warning);
        assert_eq!(translate_result(&result(2)).0, TtlStatus::Critical);
        assert_eq!(translate_result(&result(-1)).0, TtlStatus::Critical);
    }

    #[test]
    fn probe_output_is_forwarded() {
        let (_, output) = translate_result(&result(0));
        assert_eq!(output, "probe output");
    }

    #[test]
    fn probe_failure_is_critical_with_the_error_as_output() {
        let failed = CheckResult {
            exit_code: 0,
            err: Some("exec format error".to_string()),
            ..Default::default()
        };
        let (status, output) = translate_result(&failed);
        assert_eq!(status, TtlStatus::Critical);
        assert_eq!(output, "exec format error");
    }
}
