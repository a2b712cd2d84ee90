//! Lifecycle plans: stages of (resource type, action) steps

use crate::owner::{ClusterArchitecture, Owner};
use crate::poller::{ConvergenceTarget, DesiredState, PollSettings};
use crate::resource::{CloudResource, ResourceType};
use serde::{Deserialize, Serialize};

/// Mutating call to issue against a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Stop,
    Start,
    Terminate,
    Delete,
    /// Volume from instance, gateway from VPC, Elastic IP from its association
    Detach,
    Release,
    /// Revoke security group rules (the default allow-all egress rule is kept)
    RevokeRules,
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleAction::Stop => write!(f, "stop"),
            LifecycleAction::Start => write!(f, "start"),
            LifecycleAction::Terminate => write!(f, "terminate"),
            LifecycleAction::Delete => write!(f, "delete"),
            LifecycleAction::Detach => write!(f, "detach"),
            LifecycleAction::Release => write!(f, "release"),
            LifecycleAction::RevokeRules => write!(f, "revoke rules of"),
        }
    }
}

/// What a plan was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "architecture", rename_all = "snake_case")]
pub enum Operation {
    Hibernate(ClusterArchitecture),
    Resume(ClusterArchitecture),
    NetworkTeardown,
    ExpiredSweep,
}

impl Operation {
    /// Compute operations must not continue past an unconfirmed state change
    pub fn is_compute(&self) -> bool {
        matches!(self, Operation::Hibernate(_) | Operation::Resume(_))
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Hibernate(arch) => write!(f, "hibernate ({arch})"),
            Operation::Resume(arch) => write!(f, "resume ({arch})"),
            Operation::NetworkTeardown => write!(f, "network teardown"),
            Operation::ExpiredSweep => write!(f, "expired sweep"),
        }
    }
}

/// One action applied to a set of resources of one type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStep {
    pub resource_type: ResourceType,
    pub action: LifecycleAction,
    pub targets: Vec<CloudResource>,
}

impl StageStep {
    pub fn new(
        resource_type: ResourceType,
        action: LifecycleAction,
        targets: Vec<CloudResource>,
    ) -> Self {
        Self {
            resource_type,
            action,
            targets,
        }
    }

    pub fn target_ids(&self) -> Vec<String> {
        self.targets.iter().map(|r| r.id.clone()).collect()
    }
}

/// What happens to the rest of the plan when a stage's wait times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Best effort: report and move on to the next stage
    Continue,
    /// Terminal: the plan fails here
    Abort,
}

/// Which resources a convergence check polls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceScope {
    /// Fixed set of ids
    Resources(Vec<String>),
    /// Re-list resources of the plan owner in the given state on every poll
    ///
    /// Needed when replacements come up under new ids.
    OwnedInState(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceCheck {
    pub resource_type: ResourceType,
    pub scope: ConvergenceScope,
    pub desired: DesiredState,
    pub settings: PollSettings,
}

impl ConvergenceCheck {
    pub fn resources(
        resource_type: ResourceType,
        ids: Vec<String>,
        desired: DesiredState,
        settings: PollSettings,
    ) -> Self {
        Self {
            resource_type,
            scope: ConvergenceScope::Resources(ids),
            desired,
            settings,
        }
    }

    pub fn owned_in_state(
        resource_type: ResourceType,
        state: impl Into<String>,
        desired: DesiredState,
        settings: PollSettings,
    ) -> Self {
        Self {
            resource_type,
            scope: ConvergenceScope::OwnedInState(state.into()),
            desired,
            settings,
        }
    }

    /// Poller target for this check
    pub fn target(&self, stage: &str) -> ConvergenceTarget {
        let resource_ids = match &self.scope {
            ConvergenceScope::Resources(ids) => ids.clone(),
            ConvergenceScope::OwnedInState(_) => Vec::new(),
        };
        ConvergenceTarget {
            label: format!("{stage}: {} {}", self.resource_type, self.desired),
            resource_ids,
            desired: self.desired.clone(),
            settings: self.settings,
        }
    }
}

/// A group of steps that must finish before the next stage starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStage {
    pub name: String,
    pub steps: Vec<StageStep>,
    /// Waits run in order after the steps; empty means no wait
    pub wait_for_convergence: Vec<ConvergenceCheck>,
    pub on_timeout: TimeoutPolicy,
}

impl LifecycleStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            wait_for_convergence: Vec::new(),
            on_timeout: TimeoutPolicy::Continue,
        }
    }

    /// Add a step; steps without targets are dropped
    pub fn with_step(
        mut self,
        resource_type: ResourceType,
        action: LifecycleAction,
        targets: Vec<CloudResource>,
    ) -> Self {
        if !targets.is_empty() {
            self.steps.push(StageStep::new(resource_type, action, targets));
        }
        self
    }

    pub fn with_check(mut self, check: ConvergenceCheck) -> Self {
        self.wait_for_convergence.push(check);
        self
    }

    pub fn abort_on_timeout(mut self) -> Self {
        self.on_timeout = TimeoutPolicy::Abort;
        self
    }

    pub fn waits_for_convergence(&self) -> bool {
        !self.wait_for_convergence.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn target_count(&self) -> usize {
        self.steps.iter().map(|s| s.targets.len()).sum()
    }
}

/// Resource left alone by the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedResource {
    pub id: String,
    pub resource_type: ResourceType,
    pub reason: String,
}

impl SkippedResource {
    pub fn new(resource: &CloudResource, reason: impl Into<String>) -> Self {
        Self {
            id: resource.id.clone(),
            resource_type: resource.resource_type,
            reason: reason.into(),
        }
    }
}

/// Ordered stages for one target, consumed once by the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecyclePlan {
    /// Owner every target was proven against
    pub owner: Option<Owner>,

    pub operation: Operation,

    /// Cluster name, VPC id, or sweep label
    pub target_id: String,

    pub region: String,

    pub stages: Vec<LifecycleStage>,

    pub skipped: Vec<SkippedResource>,

    pub dry_run: bool,
}

impl LifecyclePlan {
    pub fn new(target_id: impl Into<String>, operation: Operation, region: impl Into<String>) -> Self {
        Self {
            owner: None,
            operation,
            target_id: target_id.into(),
            region: region.into(),
            stages: Vec::new(),
            skipped: Vec::new(),
            dry_run: true,
        }
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Append a stage unless it has nothing to do
    pub fn push_stage(&mut self, stage: LifecycleStage) {
        if !stage.is_empty() {
            self.stages.push(stage);
        }
    }

    pub fn skip(&mut self, resource: &CloudResource, reason: impl Into<String>) {
        self.skipped.push(SkippedResource::new(resource, reason));
    }

    pub fn has_changes(&self) -> bool {
        self.stages.iter().any(|s| !s.is_empty())
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Every target of the given type, across all stages
    pub fn targets_of(&self, resource_type: ResourceType) -> Vec<&CloudResource> {
        self.stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .filter(|step| step.resource_type == resource_type)
            .flat_map(|step| step.targets.iter())
            .collect()
    }

    /// One "would do X to Y" line per planned action
    pub fn describe(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps.iter())
            .flat_map(|step| {
                step.targets.iter().map(move |r| {
                    format!(
                        "would {} {} {}",
                        step.action,
                        step.resource_type.display_name(),
                        r.id
                    )
                })
            })
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            stages: self.stages.len(),
            skipped: self.skipped.len(),
            ..Default::default()
        };
        for step in self.stages.iter().flat_map(|s| s.steps.iter()) {
            let n = step.targets.len();
            match step.action {
                LifecycleAction::Stop => summary.stop += n,
                LifecycleAction::Start => summary.start += n,
                LifecycleAction::Terminate => summary.terminate += n,
                LifecycleAction::Delete | LifecycleAction::Release => summary.delete += n,
                LifecycleAction::Detach | LifecycleAction::RevokeRules => summary.detach += n,
            }
        }
        summary
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub stages: usize,
    pub stop: usize,
    pub start: usize,
    pub terminate: usize,
    pub delete: usize,
    pub detach: usize,
    pub skipped: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} stages: {} to stop, {} to start, {} to terminate, {} to delete, {} to detach, {} skipped",
            self.stages,
            self.stop,
            self.start,
            self.terminate,
            self.delete,
            self.detach,
            self.skipped
        )
    }
}
