//! Lifecycle planning
//!
//! Turns an inventory snapshot plus an owner and operation into an ordered
//! [`LifecyclePlan`]. Every target is proven owned first; everything else is
//! left alone.
//!
//! Network teardown follows the AWS dependency graph:
//!
//! ```text
//!  1 nat_gateways ──wait──▶ 2 instances ──wait──▶ 3 load_balancers
//!  ▶ 4 network_interfaces ▶ 5 security_groups ▶ 6 subnets ▶ 7 route_tables
//!  ▶ 8 elastic_ips ▶ 9 internet_gateways ▶ 10 vpc_endpoints ▶ 11 vpc
//! ```

use crate::action::{
    ConvergenceCheck, LifecycleAction, LifecyclePlan, LifecycleStage, Operation,
};
use crate::error::{Result, WardenError};
use crate::expiration::ExpiredResource;
use crate::owner::{ClusterArchitecture, Owner};
use crate::ownership::OwnershipResolver;
use crate::poller::{DesiredState, PollSettings};
use crate::resource::{CloudResource, ResourceType, attr};
use crate::tags::{
    CLUSTER_OWNERSHIP_PREFIX, TAG_BUILD_ID, TAG_CLUSTER_ID, TAG_HCP_CLUSTER_NAME,
    TAG_KUBERNETES_CLUSTER,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const STATE_RUNNING: &str = "running";
pub const STATE_STOPPED: &str = "stopped";
pub const STATE_TERMINATED: &str = "terminated";
pub const STATE_AVAILABLE: &str = "available";
pub const STATE_DELETED: &str = "deleted";

/// Instance states that need no terminate call
const INSTANCE_GONE_STATES: &[&str] = &["terminated", "shutting-down"];

/// NAT gateway states that need no delete call
const NAT_GONE_STATES: &[&str] = &["deleted", "deleting"];

const DEFAULT_SECURITY_GROUP: &str = "default";

/// Identity tags that mark a resource as some cluster's or build's
const OWNERSHIP_HINT_TAGS: &[&str] = &[TAG_BUILD_ID, TAG_HCP_CLUSTER_NAME, TAG_CLUSTER_ID];

/// Poll budgets for the waits the planner attaches to stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub compute: PollSettings,
    pub instance_termination: PollSettings,
    pub nat_gateway: PollSettings,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            compute: PollSettings::compute(),
            instance_termination: PollSettings::instance_termination(),
            nat_gateway: PollSettings::nat_gateway(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifecyclePlanner {
    resolver: OwnershipResolver,
    settings: PlannerSettings,
}

impl LifecyclePlanner {
    pub fn new(resolver: OwnershipResolver, settings: PlannerSettings) -> Self {
        Self { resolver, settings }
    }

    pub fn resolver(&self) -> &OwnershipResolver {
        &self.resolver
    }

    /// Plan a compute operation for `owner`
    ///
    /// Network teardown is keyed by a VPC rather than an owner; see
    /// [`plan_network_teardown`](Self::plan_network_teardown).
    ///
    /// Expired sweeps have no owner and are rejected; evaluate expiration
    /// first and hand the result to
    /// [`plan_expired_sweep`](Self::plan_expired_sweep).
    pub fn plan(
        &self,
        resources: &[CloudResource],
        owner: &Owner,
        operation: Operation,
        region: &str,
    ) -> Result<LifecyclePlan> {
        match operation {
            Operation::Hibernate(arch) => Ok(self.plan_hibernate(resources, owner, arch, region)),
            Operation::Resume(arch) => Ok(self.plan_resume(resources, owner, arch, region)),
            Operation::ExpiredSweep => Err(WardenError::UnsupportedOperation(format!(
                "{operation} is planned from expiration, not from owner {}",
                owner.key
            ))),
            Operation::NetworkTeardown => {
                let mut plan = LifecyclePlan::new(&owner.key, operation, region)
                    .with_owner(owner.clone());
                let owned = self.select(resources, owner, ResourceType::Vpc, &mut plan, |_| true);
                Ok(match owned.first() {
                    Some(vpc) => self.plan_network_teardown(vpc, resources, region),
                    None => plan,
                })
            }
        }
    }

    /// Stop the owner's running instances, then (hosted control plane only)
    /// detach and delete their disposable volumes
    pub fn plan_hibernate(
        &self,
        resources: &[CloudResource],
        owner: &Owner,
        arch: ClusterArchitecture,
        region: &str,
    ) -> LifecyclePlan {
        let mut plan = LifecyclePlan::new(&owner.key, Operation::Hibernate(arch), region)
            .with_owner(owner.clone());

        let instances = self.select(resources, owner, ResourceType::Instance, &mut plan, |r| {
            r.state == STATE_RUNNING
        });
        let instance_ids: Vec<String> = instances.iter().map(|r| r.id.clone()).collect();

        plan.push_stage(
            LifecycleStage::new("stop_instances")
                .with_step(ResourceType::Instance, LifecycleAction::Stop, instances.clone())
                .with_check(ConvergenceCheck::resources(
                    ResourceType::Instance,
                    instance_ids.clone(),
                    DesiredState::at_least(instance_ids.len(), STATE_STOPPED),
                    self.settings.compute,
                ))
                .abort_on_timeout(),
        );

        if arch == ClusterArchitecture::HostedControlPlane && !instance_ids.is_empty() {
            let volumes = self.disposable_volumes(resources, owner, &instance_ids, &mut plan);
            plan.push_stage(
                LifecycleStage::new("volumes")
                    .with_step(ResourceType::Volume, LifecycleAction::Detach, volumes.clone())
                    .with_step(ResourceType::Volume, LifecycleAction::Delete, volumes),
            );
        }

        plan
    }

    /// Bring the owner's stopped instances back
    ///
    /// IPI instances are started in place. Hosted-control-plane workers are
    /// terminated so the node pool replaces them, which is why both waits
    /// re-list owned instances instead of polling fixed ids.
    pub fn plan_resume(
        &self,
        resources: &[CloudResource],
        owner: &Owner,
        arch: ClusterArchitecture,
        region: &str,
    ) -> LifecyclePlan {
        let mut plan = LifecyclePlan::new(&owner.key, Operation::Resume(arch), region)
            .with_owner(owner.clone());

        let instances = self.select(resources, owner, ResourceType::Instance, &mut plan, |r| {
            r.state == STATE_STOPPED
        });
        let expected = instances.len();
        let action = match arch {
            ClusterArchitecture::Ipi => LifecycleAction::Start,
            ClusterArchitecture::HostedControlPlane => LifecycleAction::Terminate,
        };

        plan.push_stage(
            LifecycleStage::new("resume_instances")
                .with_step(ResourceType::Instance, action, instances)
                .with_check(ConvergenceCheck::owned_in_state(
                    ResourceType::Instance,
                    STATE_RUNNING,
                    DesiredState::at_least(expected, STATE_RUNNING),
                    self.settings.compute,
                ))
                .with_check(ConvergenceCheck::owned_in_state(
                    ResourceType::Instance,
                    STATE_RUNNING,
                    DesiredState::healthy(),
                    self.settings.compute,
                ))
                .abort_on_timeout(),
        );

        plan
    }

    /// Dependency-ordered teardown of one VPC and its children
    ///
    /// Children are proven against the VPC's build id, never against the VPC
    /// id. A VPC without a build id yields an empty plan.
    pub fn plan_network_teardown(
        &self,
        vpc: &CloudResource,
        resources: &[CloudResource],
        region: &str,
    ) -> LifecyclePlan {
        let mut plan = LifecyclePlan::new(&vpc.id, Operation::NetworkTeardown, region);

        let Some(build_id) = vpc.tags.get(TAG_BUILD_ID).filter(|id| !id.is_empty()) else {
            warn!(vpc_id = %vpc.id, "VPC carries no build id, skipping teardown");
            plan.skip(vpc, "VPC carries no build id");
            return plan;
        };
        let owner = Owner::ci_build(build_id);
        plan.owner = Some(owner.clone());

        let children: Vec<CloudResource> = resources
            .iter()
            .filter(|r| r.is_in_vpc(&vpc.id))
            .cloned()
            .collect();
        let mut pick = |ty: ResourceType, keep: fn(&CloudResource) -> bool| {
            self.select(&children, &owner, ty, &mut plan, keep)
        };

        let nat_gateways = pick(ResourceType::NatGateway, |r| {
            !NAT_GONE_STATES.contains(&r.state.as_str())
        });
        let instances = pick(ResourceType::Instance, |r| {
            !INSTANCE_GONE_STATES.contains(&r.state.as_str())
        });
        let classic_lbs = pick(ResourceType::ClassicLoadBalancer, |_| true);
        let load_balancers = pick(ResourceType::LoadBalancer, |_| true);
        let interfaces = pick(ResourceType::NetworkInterface, |r| r.state == STATE_AVAILABLE);
        let security_groups = pick(ResourceType::SecurityGroup, |r| {
            r.attribute_str(attr::GROUP_NAME) != Some(DEFAULT_SECURITY_GROUP)
        });
        let subnets = pick(ResourceType::Subnet, |_| true);
        let route_tables = pick(ResourceType::RouteTable, |r| !r.flag(attr::IS_MAIN));
        let elastic_ips = pick(ResourceType::ElasticIp, |_| true);
        let gateways = pick(ResourceType::InternetGateway, |_| true);
        let endpoints = pick(ResourceType::VpcEndpoint, |_| true);

        let associated_ips: Vec<CloudResource> = elastic_ips
            .iter()
            .filter(|r| r.attribute_str(attr::ASSOCIATION_ID).is_some())
            .cloned()
            .collect();
        let nat_ids: Vec<String> = nat_gateways.iter().map(|r| r.id.clone()).collect();
        let instance_ids: Vec<String> = instances.iter().map(|r| r.id.clone()).collect();

        plan.push_stage(
            LifecycleStage::new("nat_gateways")
                .with_step(ResourceType::NatGateway, LifecycleAction::Delete, nat_gateways)
                .with_check(ConvergenceCheck::resources(
                    ResourceType::NatGateway,
                    nat_ids,
                    DesiredState::all_gone_or(STATE_DELETED),
                    self.settings.nat_gateway,
                )),
        );
        plan.push_stage(
            LifecycleStage::new("instances")
                .with_step(ResourceType::Instance, LifecycleAction::Terminate, instances)
                .with_check(ConvergenceCheck::resources(
                    ResourceType::Instance,
                    instance_ids,
                    DesiredState::all_gone_or(STATE_TERMINATED),
                    self.settings.instance_termination,
                )),
        );
        plan.push_stage(
            LifecycleStage::new("load_balancers")
                .with_step(ResourceType::ClassicLoadBalancer, LifecycleAction::Delete, classic_lbs)
                .with_step(ResourceType::LoadBalancer, LifecycleAction::Delete, load_balancers),
        );
        plan.push_stage(
            LifecycleStage::new("network_interfaces").with_step(
                ResourceType::NetworkInterface,
                LifecycleAction::Delete,
                interfaces,
            ),
        );
        plan.push_stage(
            LifecycleStage::new("security_groups")
                .with_step(
                    ResourceType::SecurityGroup,
                    LifecycleAction::RevokeRules,
                    security_groups.clone(),
                )
                .with_step(ResourceType::SecurityGroup, LifecycleAction::Delete, security_groups),
        );
        plan.push_stage(
            LifecycleStage::new("subnets").with_step(
                ResourceType::Subnet,
                LifecycleAction::Delete,
                subnets,
            ),
        );
        plan.push_stage(
            LifecycleStage::new("route_tables").with_step(
                ResourceType::RouteTable,
                LifecycleAction::Delete,
                route_tables,
            ),
        );
        plan.push_stage(
            LifecycleStage::new("elastic_ips")
                .with_step(ResourceType::ElasticIp, LifecycleAction::Detach, associated_ips)
                .with_step(ResourceType::ElasticIp, LifecycleAction::Release, elastic_ips),
        );
        plan.push_stage(
            LifecycleStage::new("internet_gateways")
                .with_step(ResourceType::InternetGateway, LifecycleAction::Detach, gateways.clone())
                .with_step(ResourceType::InternetGateway, LifecycleAction::Delete, gateways),
        );
        plan.push_stage(
            LifecycleStage::new("vpc_endpoints").with_step(
                ResourceType::VpcEndpoint,
                LifecycleAction::Delete,
                endpoints,
            ),
        );
        plan.push_stage(LifecycleStage::new("vpc").with_step(
            ResourceType::Vpc,
            LifecycleAction::Delete,
            vec![vpc.clone()],
        ));

        plan
    }

    /// Single stage deleting already-expired resources, oldest first
    ///
    /// Expiration is the ownership proof here: the resource carries the CI
    /// tags and has outlived its grace period.
    pub fn plan_expired_sweep(&self, expired: &[ExpiredResource], region: &str) -> LifecyclePlan {
        let mut plan = LifecyclePlan::new("expired", Operation::ExpiredSweep, region);

        let mut ordered: Vec<&ExpiredResource> = expired.iter().collect();
        ordered.sort_by_key(|e| e.expires_at);

        let mut stage = LifecycleStage::new("expired");
        for entry in ordered {
            let r = &entry.resource;
            match r.resource_type {
                ResourceType::ElasticIp => {
                    if r.attribute_str(attr::ASSOCIATION_ID).is_some() {
                        stage = stage.with_step(
                            ResourceType::ElasticIp,
                            LifecycleAction::Detach,
                            vec![r.clone()],
                        );
                    }
                    stage = stage.with_step(
                        ResourceType::ElasticIp,
                        LifecycleAction::Release,
                        vec![r.clone()],
                    );
                }
                ty => {
                    stage = stage.with_step(ty, LifecycleAction::Delete, vec![r.clone()]);
                }
            }
        }
        plan.push_stage(stage);
        plan
    }

    /// Owned resources of one type passing `keep`, recording skips
    ///
    /// Only resources that look related (an identity or cluster ownership
    /// tag, the owner's name prefix, or a tag value equal to the owner key)
    /// are recorded as skipped; everything else is silently ignored.
    fn select(
        &self,
        resources: &[CloudResource],
        owner: &Owner,
        resource_type: ResourceType,
        plan: &mut LifecyclePlan,
        keep: impl Fn(&CloudResource) -> bool,
    ) -> Vec<CloudResource> {
        let mut selected = Vec::new();
        for r in resources.iter().filter(|r| r.resource_type == resource_type) {
            match self.resolver.prove(r, owner) {
                Ok(_) if keep(r) => selected.push(r.clone()),
                Ok(_) => debug!(resource_id = %r.id, state = %r.state, "Owned but not eligible"),
                Err(e) if looks_related(r, owner) => {
                    warn!(
                        resource_id = %r.id,
                        resource_type = %r.resource_type,
                        error = %e,
                        "Skipping resource"
                    );
                    plan.skip(r, e.to_string());
                }
                Err(e) => debug!(resource_id = %r.id, error = %e, "Not owned"),
            }
        }
        selected
    }

    fn disposable_volumes(
        &self,
        resources: &[CloudResource],
        owner: &Owner,
        instance_ids: &[String],
        plan: &mut LifecyclePlan,
    ) -> Vec<CloudResource> {
        let mut volumes = Vec::new();
        for v in resources
            .iter()
            .filter(|r| r.resource_type == ResourceType::Volume)
            .filter(|r| {
                r.attribute_str(attr::ATTACHED_INSTANCE)
                    .is_some_and(|id| instance_ids.iter().any(|i| i == id))
            })
        {
            if !v.flag(attr::DELETE_ON_TERMINATION) {
                plan.skip(v, "DeleteOnTermination is false");
            } else if v.tags.has(TAG_KUBERNETES_CLUSTER) {
                plan.skip(v, "owned by the in-cluster storage subsystem");
            } else if let Some(reason) = self.resolver.identity_conflict(v, owner) {
                plan.skip(v, reason);
            } else {
                volumes.push(v.clone());
            }
        }
        volumes
    }
}

/// Carries an ownership hint worth reporting when proof fails
fn looks_related(resource: &CloudResource, owner: &Owner) -> bool {
    let tags = &resource.tags;
    let by_hint = OWNERSHIP_HINT_TAGS.iter().any(|k| tags.has(k))
        || !tags.matches_prefix(CLUSTER_OWNERSHIP_PREFIX).is_empty();
    let segment = owner.cluster_segment();
    let by_name = !segment.is_empty() && resource.name().is_some_and(|n| n.starts_with(segment));
    let by_tag = !owner.key.is_empty() && tags.iter().any(|(_, v)| v == owner.key);
    by_hint || by_name || by_tag
}
