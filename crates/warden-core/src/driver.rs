//! Plan execution
//!
//! The [`LifecycleDriver`] walks a [`LifecyclePlan`] stage by stage. Actions
//! are issued serially; failures are recorded per resource and never stop a
//! stage. Waits run after a stage's actions, and a timed-out wait aborts the
//! run only when the stage says so.

use crate::action::{
    ConvergenceCheck, ConvergenceScope, LifecycleAction, LifecyclePlan, StageStep, TimeoutPolicy,
};
use crate::error::Result;
use crate::ownership::OwnershipResolver;
use crate::poller::{ConvergencePoller, ObservedState};
use crate::provider::{CloudClientSet, RetryConfig};
use crate::report::{Outcome, ResourceOutcome, RunReport};
use crate::resource::{CloudResource, ResourceType};
use std::slice;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct LifecycleDriver {
    clients: CloudClientSet,
    resolver: OwnershipResolver,
    poller: ConvergencePoller,
    volume_retry: RetryConfig,
}

impl LifecycleDriver {
    pub fn new(clients: CloudClientSet, resolver: OwnershipResolver) -> Self {
        Self {
            clients,
            resolver,
            poller: ConvergencePoller::new(),
            volume_retry: RetryConfig::volume_delete(),
        }
    }

    pub fn with_volume_retry(mut self, retry: RetryConfig) -> Self {
        self.volume_retry = retry;
        self
    }

    /// Execute every stage of `plan` and report what happened
    pub async fn execute(&self, plan: &LifecyclePlan) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::for_plan(plan);
        let mut aborted = false;

        info!(
            target_id = %plan.target_id,
            operation = %plan.operation,
            region = %plan.region,
            dry_run = plan.dry_run,
            summary = %plan.summary(),
            "Executing plan"
        );

        for stage in &plan.stages {
            info!(stage = %stage.name, targets = stage.target_count(), "Stage started");

            let mut stage_failed = false;
            for step in &stage.steps {
                let outcomes = self.run_step(plan, step).await;
                stage_failed |= outcomes.iter().any(|o| o.outcome.is_failure());
                report.acted_on.extend(outcomes);
            }
            report.stages_executed.push(stage.name.clone());

            if plan.dry_run {
                continue;
            }

            if stage_failed && stage.on_timeout == TimeoutPolicy::Abort {
                warn!(stage = %stage.name, "Stage failed, not continuing");
                aborted = true;
                break;
            }

            for check in &stage.wait_for_convergence {
                let target = check.target(&stage.name);
                let waited = self
                    .poller
                    .await_convergence(&target, || self.observe_for(plan, check))
                    .await;

                if let Err(e) = waited {
                    warn!(stage = %stage.name, error = %e, "Convergence wait failed");
                    report.convergence_timeouts.push(target.label);
                    if stage.on_timeout == TimeoutPolicy::Abort {
                        aborted = true;
                    }
                    break;
                }
            }
            if aborted {
                break;
            }
        }

        report.finish(aborted, whole_millis(started.elapsed()));
        info!(
            target_id = %plan.target_id,
            status = %report.status,
            acted_on = report.acted_on.len(),
            skipped = report.skipped.len(),
            "Plan finished"
        );
        report
    }

    async fn run_step(&self, plan: &LifecyclePlan, step: &StageStep) -> Vec<ResourceOutcome> {
        if plan.dry_run {
            return step
                .targets
                .iter()
                .map(|r| {
                    let message = format!(
                        "would {} {} {}",
                        step.action,
                        r.resource_type.display_name(),
                        r.id
                    );
                    info!(
                        resource_id = %r.id,
                        resource_type = %r.resource_type,
                        "[DRY RUN] {message}"
                    );
                    outcome(r, step.action, Outcome::DryRun, message)
                })
                .collect();
        }

        if step.resource_type.supports_batch() {
            info!(
                resource_type = %step.resource_type,
                count = step.targets.len(),
                "{} {} resources",
                step.action,
                step.targets.len()
            );
            let result = self.clients.actions.perform(step.action, &step.targets).await;
            return step
                .targets
                .iter()
                .map(|r| outcome_of(r, step.action, &result))
                .collect();
        }

        let mut outcomes = Vec::with_capacity(step.targets.len());
        for r in &step.targets {
            info!(
                resource_id = %r.id,
                resource_type = %r.resource_type,
                "{} {}",
                step.action,
                r.id
            );
            let result = if r.resource_type == ResourceType::Volume
                && step.action == LifecycleAction::Delete
            {
                self.perform_with_retry(step.action, r).await
            } else {
                self.clients
                    .actions
                    .perform(step.action, slice::from_ref(r))
                    .await
            };
            outcomes.push(outcome_of(r, step.action, &result));
        }
        outcomes
    }

    /// Bounded fixed-delay retry for eventually-consistent deletes
    async fn perform_with_retry(
        &self,
        action: LifecycleAction,
        resource: &CloudResource,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self
                .clients
                .actions
                .perform(action, slice::from_ref(resource))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_idempotent_success() || attempt >= self.volume_retry.max_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        resource_id = %resource.id,
                        attempt,
                        max_attempts = self.volume_retry.max_attempts,
                        error = %e,
                        "Retrying {action}"
                    );
                    tokio::time::sleep(self.volume_retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn observe_for(
        &self,
        plan: &LifecyclePlan,
        check: &ConvergenceCheck,
    ) -> Result<Vec<ObservedState>> {
        let inventory = &self.clients.inventory;
        match &check.scope {
            ConvergenceScope::Resources(ids) => {
                inventory
                    .observe(check.resource_type, &plan.region, ids)
                    .await
            }
            ConvergenceScope::OwnedInState(state) => {
                let Some(owner) = &plan.owner else {
                    return Ok(Vec::new());
                };
                let ids: Vec<String> = inventory
                    .list_resources(check.resource_type, &plan.region, Some(state))
                    .await?
                    .into_iter()
                    .filter(|r| self.resolver.belongs_to(r, owner))
                    .map(|r| r.id)
                    .collect();
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                inventory
                    .observe(check.resource_type, &plan.region, &ids)
                    .await
            }
        }
    }
}

/// Milliseconds, saturating at `u64::MAX`
fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn outcome(
    resource: &CloudResource,
    action: LifecycleAction,
    outcome: Outcome,
    message: String,
) -> ResourceOutcome {
    ResourceOutcome {
        id: resource.id.clone(),
        resource_type: resource.resource_type,
        action,
        outcome,
        message,
    }
}

fn outcome_of(
    resource: &CloudResource,
    action: LifecycleAction,
    result: &Result<()>,
) -> ResourceOutcome {
    match result {
        Ok(()) => outcome(resource, action, Outcome::Succeeded, String::new()),
        Err(e) if e.is_idempotent_success() => {
            info!(resource_id = %resource.id, "Already done: {e}");
            outcome(resource, action, Outcome::AlreadyDone, e.to_string())
        }
        Err(e) => {
            warn!(
                resource_id = %resource.id,
                resource_type = %resource.resource_type,
                error = %e,
                "Could not {action} resource"
            );
            outcome(resource, action, Outcome::Failed, e.to_string())
        }
    }
}
