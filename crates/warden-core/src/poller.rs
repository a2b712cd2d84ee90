//! Bounded convergence polling
//!
//! Stop, start and terminate calls return before the cloud has acted. The
//! [`ConvergencePoller`] is the one place that blocks: it sleeps, re-fetches
//! state through a caller-supplied closure, and compares against a
//! [`DesiredState`] until it matches or the attempt budget runs out.

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll cadence and attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub poll_interval_secs: u64,

    pub max_attempts: u32,

    /// Sleep before the first poll, when different from the poll interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_secs: Option<u64>,
}

impl PollSettings {
    pub fn new(poll_interval_secs: u64, max_attempts: u32) -> Self {
        Self {
            poll_interval_secs,
            max_attempts,
            initial_delay_secs: None,
        }
    }

    pub fn with_initial_delay(mut self, secs: u64) -> Self {
        self.initial_delay_secs = Some(secs);
        self
    }

    /// Instances stopping or starting: 5 s polls after a 15 s settle
    pub fn compute() -> Self {
        Self::new(5, 120).with_initial_delay(15)
    }

    /// Instances terminating during network teardown
    pub fn instance_termination() -> Self {
        Self::new(15, 40)
    }

    pub fn nat_gateway() -> Self {
        Self::new(10, 30)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.poll_interval())
    }
}

/// Two-part health check result (EC2 instance-status / system-status)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub instance_status: String,
    pub system_status: String,
}

impl HealthStatus {
    pub fn new(instance_status: impl Into<String>, system_status: impl Into<String>) -> Self {
        Self {
            instance_status: instance_status.into(),
            system_status: system_status.into(),
        }
    }
}

/// One resource's state as seen by a poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub id: String,
    pub state: String,
    pub health: Option<HealthStatus>,
}

impl ObservedState {
    pub fn new(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: state.into(),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }
}

/// Predicate a poll result must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredState {
    /// Count convergence: at least `count` resources report `state`
    AtLeast { count: usize, state: String },

    /// Every targeted resource reports `state`
    ///
    /// With `absent_is_converged`, a resource missing from the poll counts as
    /// converged (deleted resources eventually vanish from listings).
    AllInState {
        state: String,
        absent_is_converged: bool,
    },

    /// Per-resource convergence on both health checks; an empty poll never converges
    AllHealthy {
        instance_status: String,
        system_status: String,
    },
}

impl DesiredState {
    pub fn at_least(count: usize, state: impl Into<String>) -> Self {
        DesiredState::AtLeast {
            count,
            state: state.into(),
        }
    }

    pub fn all_in_state(state: impl Into<String>) -> Self {
        DesiredState::AllInState {
            state: state.into(),
            absent_is_converged: false,
        }
    }

    /// Target state is terminal and resources may disappear from listings
    pub fn all_gone_or(state: impl Into<String>) -> Self {
        DesiredState::AllInState {
            state: state.into(),
            absent_is_converged: true,
        }
    }

    /// Both checks `ok`
    pub fn healthy() -> Self {
        DesiredState::AllHealthy {
            instance_status: "ok".to_string(),
            system_status: "ok".to_string(),
        }
    }

    /// Evaluate a poll result
    ///
    /// An empty `resource_ids` evaluates over every observed resource.
    pub fn is_met(&self, resource_ids: &[String], observed: &[ObservedState]) -> bool {
        let in_scope: Vec<&ObservedState> = observed
            .iter()
            .filter(|o| resource_ids.is_empty() || resource_ids.contains(&o.id))
            .collect();

        match self {
            DesiredState::AtLeast { count, state } => {
                in_scope.iter().filter(|o| &o.state == state).count() >= *count
            }
            DesiredState::AllInState {
                state,
                absent_is_converged,
            } => {
                if resource_ids.is_empty() {
                    return in_scope.iter().all(|o| &o.state == state);
                }
                resource_ids.iter().all(|id| {
                    match in_scope.iter().find(|o| &o.id == id) {
                        Some(o) => &o.state == state,
                        None => *absent_is_converged,
                    }
                })
            }
            DesiredState::AllHealthy {
                instance_status,
                system_status,
            } => {
                let expected = resource_ids.len().max(1);
                in_scope.len() >= expected
                    && in_scope.iter().all(|o| {
                        o.health.as_ref().is_some_and(|h| {
                            &h.instance_status == instance_status
                                && &h.system_status == system_status
                        })
                    })
            }
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::AtLeast { count, state } => write!(f, "at least {count} {state}"),
            DesiredState::AllInState { state, .. } => write!(f, "all {state}"),
            DesiredState::AllHealthy {
                instance_status,
                system_status,
            } => write!(f, "all health checks {instance_status}/{system_status}"),
        }
    }
}

/// A wait the caller blocks on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceTarget {
    /// Used in logs and in the timeout error
    pub label: String,
    pub resource_ids: Vec<String>,
    pub desired: DesiredState,
    pub settings: PollSettings,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvergencePoller;

impl ConvergencePoller {
    pub fn new() -> Self {
        Self
    }

    /// Poll until `target` is met, returning the number of polls used
    ///
    /// Issues at most `max_attempts` fetches. A failed fetch is logged and
    /// counts as an unconverged attempt.
    pub async fn await_convergence<F, Fut>(
        &self,
        target: &ConvergenceTarget,
        mut fetch: F,
    ) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<ObservedState>>>,
    {
        let settings = &target.settings;
        info!(
            wait = %target.label,
            desired = %target.desired,
            max_attempts = settings.max_attempts,
            "Waiting for convergence"
        );

        for attempt in 1..=settings.max_attempts {
            let delay = if attempt == 1 {
                settings.initial_delay()
            } else {
                settings.poll_interval()
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match fetch().await {
                Ok(observed) => {
                    if target.desired.is_met(&target.resource_ids, &observed) {
                        info!(wait = %target.label, attempt, "Converged");
                        return Ok(attempt);
                    }
                    debug!(
                        wait = %target.label,
                        attempt,
                        observed = observed.len(),
                        "Not converged yet"
                    );
                }
                Err(e) => {
                    warn!(wait = %target.label, attempt, error = %e, "State fetch failed");
                }
            }
        }

        Err(WardenError::ConvergenceTimeout {
            target: target.label.clone(),
            attempts: settings.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn target(resource_ids: Vec<String>, desired: DesiredState, attempts: u32) -> ConvergenceTarget {
        ConvergenceTarget {
            label: "test".to_string(),
            resource_ids,
            desired,
            settings: PollSettings::new(5, attempts),
        }
    }

    #[test]
    fn test_at_least_counts_matching_states() {
        let desired = DesiredState::at_least(2, "stopped");
        let observed = vec![
            ObservedState::new("i-1", "stopped"),
            ObservedState::new("i-2", "stopping"),
            ObservedState::new("i-3", "stopped"),
        ];

        assert!(desired.is_met(&[], &observed));
        assert!(!desired.is_met(&ids(&["i-1", "i-2"]), &observed));
    }

    #[test]
    fn test_all_in_state_absent_handling() {
        let observed = vec![ObservedState::new("nat-1", "deleted")];
        let targets = ids(&["nat-1", "nat-2"]);

        assert!(!DesiredState::all_in_state("deleted").is_met(&targets, &observed));
        assert!(DesiredState::all_gone_or("deleted").is_met(&targets, &observed));
    }

    #[test]
    fn test_all_healthy_requires_both_checks() {
        let desired = DesiredState::healthy();
        let observed = vec![
            ObservedState::new("i-1", "running").with_health(HealthStatus::new("ok", "ok")),
            ObservedState::new("i-2", "running")
                .with_health(HealthStatus::new("initializing", "ok")),
        ];

        assert!(!desired.is_met(&[], &observed));
        assert!(desired.is_met(&ids(&["i-1"]), &observed));
        assert!(!desired.is_met(&[], &[]));
        assert!(!desired.is_met(&[], &[ObservedState::new("i-3", "running")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_matching_poll() {
        let poller = ConvergencePoller::new();
        let calls = Arc::new(AtomicU32::new(0));
        let t = target(ids(&["i-1"]), DesiredState::all_in_state("stopped"), 10);

        let counter = calls.clone();
        let attempts = poller
            .await_convergence(&t, || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let state = if n >= 3 { "stopped" } else { "stopping" };
                    Ok(vec![ObservedState::new("i-1", state)])
                }
            })
            .await;

        assert_eq!(assert_ok!(attempts), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_exactly_max_attempts() {
        let poller = ConvergencePoller::new();
        let calls = Arc::new(AtomicU32::new(0));
        let t = target(ids(&["i-1"]), DesiredState::all_in_state("stopped"), 4);

        let counter = calls.clone();
        let result = poller
            .await_convergence(&t, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(vec![ObservedState::new("i-1", "stopping")]) }
            })
            .await;

        let err = assert_err!(result);
        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_count_as_attempts() {
        let poller = ConvergencePoller::new();
        let calls = Arc::new(AtomicU32::new(0));
        let t = target(vec![], DesiredState::at_least(1, "running"), 3);

        let counter = calls.clone();
        let result = poller
            .await_convergence(&t, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(WardenError::ApiError("throttled".to_string())) }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_precedes_first_poll() {
        let poller = ConvergencePoller::new();
        let start = tokio::time::Instant::now();
        let mut t = target(vec![], DesiredState::at_least(0, "running"), 1);
        t.settings = t.settings.with_initial_delay(15);

        assert_ok!(poller.await_convergence(&t, || async { Ok(vec![]) }).await);
        assert!(start.elapsed() >= Duration::from_secs(15));
    }
}
