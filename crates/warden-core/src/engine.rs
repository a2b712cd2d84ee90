//! Entry points: list, resolve, plan, execute

use crate::action::LifecyclePlan;
use crate::driver::LifecycleDriver;
use crate::error::Result;
use crate::expiration::{ExpirationEvaluator, ExpirationPolicy, ExpiredResource};
use crate::owner::{ClusterArchitecture, Owner};
use crate::ownership::{OwnershipPolicy, OwnershipResolver};
use crate::planner::{LifecyclePlanner, PlannerSettings};
use crate::provider::{CloudClientSet, RetryConfig};
use crate::report::RunReport;
use crate::resource::{CloudResource, ResourceType};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Child types listed for a network teardown, in listing order
const TEARDOWN_TYPES: &[ResourceType] = &[
    ResourceType::NatGateway,
    ResourceType::Instance,
    ResourceType::ClassicLoadBalancer,
    ResourceType::LoadBalancer,
    ResourceType::NetworkInterface,
    ResourceType::SecurityGroup,
    ResourceType::Subnet,
    ResourceType::RouteTable,
    ResourceType::ElasticIp,
    ResourceType::InternetGateway,
    ResourceType::VpcEndpoint,
];

/// Everything the engine needs besides the cloud clients
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ownership: OwnershipPolicy,
    pub planner: PlannerSettings,
    /// VPCs and OIDC providers
    pub vpc_expiration: ExpirationPolicy,
    /// Elastic IPs, IAM roles and instance profiles
    pub global_expiration: ExpirationPolicy,
    pub volume_retry: RetryConfig,
    pub dry_run: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ownership: OwnershipPolicy::default(),
            planner: PlannerSettings::default(),
            vpc_expiration: ExpirationPolicy::for_vpcs(),
            global_expiration: ExpirationPolicy::for_global(),
            volume_retry: RetryConfig::volume_delete(),
            dry_run: true,
        }
    }
}

/// Ties inventory, resolver, planner and driver together for one account
pub struct LifecycleEngine {
    clients: CloudClientSet,
    planner: LifecyclePlanner,
    driver: LifecycleDriver,
    vpc_expiration: ExpirationEvaluator,
    global_expiration: ExpirationEvaluator,
    dry_run: bool,
}

impl LifecycleEngine {
    pub fn new(clients: CloudClientSet, settings: EngineSettings) -> Self {
        let resolver = OwnershipResolver::new(settings.ownership);
        Self {
            planner: LifecyclePlanner::new(resolver.clone(), settings.planner),
            driver: LifecycleDriver::new(clients.clone(), resolver)
                .with_volume_retry(settings.volume_retry),
            clients,
            vpc_expiration: ExpirationEvaluator::new(settings.vpc_expiration),
            global_expiration: ExpirationEvaluator::new(settings.global_expiration),
            dry_run: settings.dry_run,
        }
    }

    pub fn planner(&self) -> &LifecyclePlanner {
        &self.planner
    }

    /// Stop a cluster's compute
    pub async fn hibernate_cluster(
        &self,
        owner: &Owner,
        arch: ClusterArchitecture,
        region: &str,
    ) -> Result<RunReport> {
        let mut resources = self.list(ResourceType::Instance, region).await?;
        if arch == ClusterArchitecture::HostedControlPlane {
            resources.extend(self.list(ResourceType::Volume, region).await?);
        }
        let plan = self.planner.plan_hibernate(&resources, owner, arch, region);
        Ok(self.run(plan).await)
    }

    /// Bring a hibernated cluster back
    pub async fn resume_cluster(
        &self,
        owner: &Owner,
        arch: ClusterArchitecture,
        region: &str,
    ) -> Result<RunReport> {
        let resources = self.list(ResourceType::Instance, region).await?;
        let plan = self.planner.plan_resume(&resources, owner, arch, region);
        Ok(self.run(plan).await)
    }

    /// Tear down one VPC and every child proven to share its build id
    pub async fn teardown_vpc(&self, vpc: &CloudResource, region: &str) -> Result<RunReport> {
        let mut children = Vec::new();
        for ty in TEARDOWN_TYPES {
            children.extend(
                self.list(*ty, region)
                    .await?
                    .into_iter()
                    .filter(|r| r.is_in_vpc(&vpc.id)),
            );
        }
        let plan = self.planner.plan_network_teardown(vpc, &children, region);
        Ok(self.run(plan).await)
    }

    /// Tear down every expired VPC in the region, oldest first
    ///
    /// A VPC whose children cannot be listed is logged and skipped; the
    /// remaining VPCs are still processed.
    pub async fn teardown_expired_vpcs(
        &self,
        region: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunReport>> {
        let vpcs = self.list(ResourceType::Vpc, region).await?;
        let expired = self.vpc_expiration.expired_oldest_first(&vpcs, now);
        info!(region, total = vpcs.len(), expired = expired.len(), "Expired VPCs found");

        let mut reports = Vec::with_capacity(expired.len());
        for entry in expired {
            info!(
                vpc_id = %entry.resource.id,
                days_expired = entry.days_expired,
                "Tearing down expired VPC"
            );
            match self.teardown_vpc(&entry.resource, region).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(vpc_id = %entry.resource.id, error = %e, "Could not list VPC children"),
            }
        }
        Ok(reports)
    }

    /// Delete expired global leftovers of CI runs
    ///
    /// IAM roles, instance profiles and stand-alone Elastic IPs use the
    /// global policy; OIDC providers use the VPC policy.
    pub async fn sweep_expired_global(
        &self,
        region: &str,
        now: DateTime<Utc>,
    ) -> Result<RunReport> {
        let mut expired: Vec<ExpiredResource> = Vec::new();

        for ty in [ResourceType::IamRole, ResourceType::InstanceProfile] {
            let resources = self.list(ty, "").await?;
            expired.extend(self.global_expiration.expired_oldest_first(&resources, now));
        }
        let oidc = self.list(ResourceType::OidcProvider, "").await?;
        expired.extend(self.vpc_expiration.expired_oldest_first(&oidc, now));

        let addresses = self.list(ResourceType::ElasticIp, region).await?;
        expired.extend(self.global_expiration.expired_oldest_first(&addresses, now));

        info!(region, expired = expired.len(), "Expired global resources found");
        let plan = self.planner.plan_expired_sweep(&expired, region);
        Ok(self.run(plan).await)
    }

    /// Execute an already-built plan with the engine's dry-run setting
    pub async fn run(&self, plan: LifecyclePlan) -> RunReport {
        let plan = plan.with_dry_run(self.dry_run);
        self.driver.execute(&plan).await
    }

    async fn list(&self, resource_type: ResourceType, region: &str) -> Result<Vec<CloudResource>> {
        self.clients
            .inventory
            .list_resources(resource_type, region, None)
            .await
    }
}
