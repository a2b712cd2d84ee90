//! Write side: lifecycle actions against AWS
//!
//! Each `perform` call maps to exactly one logical provider operation.
//! Instances and VPC endpoints go out as a single batched request; every
//! other type is handled one resource at a time, stopping at the first
//! failure.

use crate::context::AwsContext;
use crate::error::{classify_aws_error, sdk};
use async_trait::async_trait;
use aws_sdk_ec2::types::IpPermission;
use tracing::{debug, info};
use warden_core::resource::attr;
use warden_core::{ActionApi, CloudResource, LifecycleAction, ResourceType, Result, WardenError};

const PROVIDER_NAME: &str = "aws";

/// [`ActionApi`] issuing EC2, ELB, ELBv2 and IAM calls
#[derive(Debug, Clone)]
pub struct AwsActions {
    ctx: AwsContext,
}

impl AwsActions {
    pub fn new(ctx: AwsContext) -> Self {
        Self { ctx }
    }

    async fn instances(
        &self,
        action: LifecycleAction,
        region: &str,
        ids: Vec<String>,
    ) -> Result<()> {
        let ec2 = self.ctx.ec2(region);
        match action {
            LifecycleAction::Stop => {
                ec2.stop_instances()
                    .set_instance_ids(Some(ids))
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            LifecycleAction::Start => {
                ec2.start_instances()
                    .set_instance_ids(Some(ids))
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            LifecycleAction::Terminate => {
                ec2.terminate_instances()
                    .set_instance_ids(Some(ids))
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            other => return Err(unsupported(ResourceType::Instance, other)),
        }
        Ok(())
    }

    /// Endpoint deletion reports per-item failures inside a successful
    /// response; any failure other than "already gone" fails the batch.
    async fn delete_vpc_endpoints(&self, region: &str, ids: Vec<String>) -> Result<()> {
        let response = self
            .ctx
            .ec2(region)
            .delete_vpc_endpoints()
            .set_vpc_endpoint_ids(Some(ids))
            .send()
            .await
            .map_err(sdk)?;

        let failures: Vec<String> = response
            .unsuccessful()
            .iter()
            .filter_map(|item| {
                let error = item.error()?;
                let classified = classify_aws_error(error.code(), error.message());
                if classified.is_not_found() {
                    return None;
                }
                Some(format!(
                    "{}: {}",
                    item.resource_id().unwrap_or("unknown"),
                    classified
                ))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(WardenError::ActionFailed(failures.join("; ")))
        }
    }

    async fn perform_one(&self, action: LifecycleAction, resource: &CloudResource) -> Result<()> {
        let region = resource.region.as_str();
        let id = resource.id.as_str();
        debug!(action = %action, resource_type = %resource.resource_type, id, "Calling provider");

        match (resource.resource_type, action) {
            (ResourceType::Volume, LifecycleAction::Detach) => {
                self.ctx
                    .ec2(region)
                    .detach_volume()
                    .volume_id(id)
                    .set_instance_id(
                        resource
                            .attribute_str(attr::ATTACHED_INSTANCE)
                            .map(str::to_string),
                    )
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::Volume, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_volume()
                    .volume_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::NetworkInterface, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_network_interface()
                    .network_interface_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::SecurityGroup, LifecycleAction::RevokeRules) => {
                self.revoke_security_group_rules(region, id).await?;
            }
            (ResourceType::SecurityGroup, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_security_group()
                    .group_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::Subnet, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_subnet()
                    .subnet_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::RouteTable, LifecycleAction::Delete) => {
                self.delete_route_table(region, id).await?;
            }
            (ResourceType::ElasticIp, LifecycleAction::Detach) => {
                let Some(association_id) = resource.attribute_str(attr::ASSOCIATION_ID) else {
                    return Err(WardenError::AlreadyInState(format!("{id} is not associated")));
                };
                self.ctx
                    .ec2(region)
                    .disassociate_address()
                    .association_id(association_id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::ElasticIp, LifecycleAction::Release) => {
                self.ctx
                    .ec2(region)
                    .release_address()
                    .allocation_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::InternetGateway, LifecycleAction::Detach) => {
                let vpc_id = resource
                    .attribute_str(attr::ATTACHED_VPC)
                    .or(resource.parent_vpc.as_deref());
                let Some(vpc_id) = vpc_id else {
                    return Err(WardenError::AlreadyInState(format!("{id} is not attached")));
                };
                self.ctx
                    .ec2(region)
                    .detach_internet_gateway()
                    .internet_gateway_id(id)
                    .vpc_id(vpc_id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::InternetGateway, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_internet_gateway()
                    .internet_gateway_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::NatGateway, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_nat_gateway()
                    .nat_gateway_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::Vpc, LifecycleAction::Delete) => {
                self.ctx
                    .ec2(region)
                    .delete_vpc()
                    .vpc_id(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::ClassicLoadBalancer, LifecycleAction::Delete) => {
                self.ctx
                    .elb(region)
                    .delete_load_balancer()
                    .load_balancer_name(id)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::LoadBalancer, LifecycleAction::Delete) => {
                let arn = required_arn(resource)?;
                self.ctx
                    .elbv2(region)
                    .delete_load_balancer()
                    .load_balancer_arn(arn)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ResourceType::IamRole, LifecycleAction::Delete) => {
                self.delete_iam_role(id).await?;
            }
            (ResourceType::InstanceProfile, LifecycleAction::Delete) => {
                self.delete_instance_profile(id).await?;
            }
            (ResourceType::OidcProvider, LifecycleAction::Delete) => {
                let arn = required_arn(resource)?;
                self.ctx
                    .iam()
                    .delete_open_id_connect_provider()
                    .open_id_connect_provider_arn(arn)
                    .send()
                    .await
                    .map_err(sdk)?;
            }
            (ty, other) => return Err(unsupported(ty, other)),
        }
        Ok(())
    }

    /// Strip rules so groups that reference each other can be deleted
    ///
    /// The stock allow-all egress rule stays; it references nothing.
    async fn revoke_security_group_rules(&self, region: &str, group_id: &str) -> Result<()> {
        let ec2 = self.ctx.ec2(region);
        let response = ec2
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .map_err(sdk)?;
        let Some(group) = response.security_groups().first() else {
            return Err(WardenError::ResourceNotFound(group_id.to_string()));
        };

        let ingress = group.ip_permissions().to_vec();
        if !ingress.is_empty() {
            ec2.revoke_security_group_ingress()
                .group_id(group_id)
                .set_ip_permissions(Some(ingress))
                .send()
                .await
                .map_err(sdk)?;
        }

        let egress: Vec<IpPermission> = group
            .ip_permissions_egress()
            .iter()
            .filter(|p| !is_default_egress(p))
            .cloned()
            .collect();
        if !egress.is_empty() {
            ec2.revoke_security_group_egress()
                .group_id(group_id)
                .set_ip_permissions(Some(egress))
                .send()
                .await
                .map_err(sdk)?;
        }
        Ok(())
    }

    /// Explicit subnet associations block deletion; the main association
    /// cannot be removed and never occurs here.
    async fn delete_route_table(&self, region: &str, route_table_id: &str) -> Result<()> {
        let ec2 = self.ctx.ec2(region);
        let response = ec2
            .describe_route_tables()
            .route_table_ids(route_table_id)
            .send()
            .await
            .map_err(sdk)?;

        let associations: Vec<String> = response
            .route_tables()
            .iter()
            .flat_map(|t| t.associations())
            .filter(|a| !a.main().unwrap_or(false))
            .filter_map(|a| a.route_table_association_id().map(str::to_string))
            .collect();
        for association_id in associations {
            let result = ec2
                .disassociate_route_table()
                .association_id(&association_id)
                .send()
                .await
                .map_err(sdk);
            tolerate_gone(result, "disassociate_route_table", &association_id)?;
        }

        ec2.delete_route_table()
            .route_table_id(route_table_id)
            .send()
            .await
            .map_err(sdk)?;
        Ok(())
    }

    /// Roles refuse deletion while policies or instance profiles hang off them
    async fn delete_iam_role(&self, role_name: &str) -> Result<()> {
        let iam = self.ctx.iam();

        let attached = iam
            .list_attached_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk)?;
        for policy in attached.attached_policies() {
            if let Some(arn) = policy.policy_arn() {
                let result = iam
                    .detach_role_policy()
                    .role_name(role_name)
                    .policy_arn(arn)
                    .send()
                    .await
                    .map_err(sdk);
                tolerate_gone(result, "detach_role_policy", arn)?;
            }
        }

        let inline = iam
            .list_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk)?;
        for policy_name in inline.policy_names() {
            let result = iam
                .delete_role_policy()
                .role_name(role_name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(sdk);
            tolerate_gone(result, "delete_role_policy", policy_name)?;
        }

        let profiles = iam
            .list_instance_profiles_for_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk)?;
        for profile in profiles.instance_profiles() {
            let profile_name = profile.instance_profile_name();
            let result = iam
                .remove_role_from_instance_profile()
                .instance_profile_name(profile_name)
                .role_name(role_name)
                .send()
                .await
                .map_err(sdk);
            tolerate_gone(result, "remove_role_from_instance_profile", profile_name)?;
        }

        iam.delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk)?;
        Ok(())
    }

    async fn delete_instance_profile(&self, profile_name: &str) -> Result<()> {
        let iam = self.ctx.iam();

        let response = iam
            .get_instance_profile()
            .instance_profile_name(profile_name)
            .send()
            .await
            .map_err(sdk)?;
        if let Some(profile) = response.instance_profile() {
            for role in profile.roles() {
                let result = iam
                    .remove_role_from_instance_profile()
                    .instance_profile_name(profile_name)
                    .role_name(role.role_name())
                    .send()
                    .await
                    .map_err(sdk);
                tolerate_gone(result, "remove_role_from_instance_profile", role.role_name())?;
            }
        }

        iam.delete_instance_profile()
            .instance_profile_name(profile_name)
            .send()
            .await
            .map_err(sdk)?;
        Ok(())
    }
}

#[async_trait]
impl ActionApi for AwsActions {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn perform(&self, action: LifecycleAction, resources: &[CloudResource]) -> Result<()> {
        let Some(first) = resources.first() else {
            return Ok(());
        };
        let resource_type = first.resource_type;
        let region = first.region.as_str();
        info!(
            action = %action,
            resource_type = %resource_type,
            region,
            count = resources.len(),
            "Performing action"
        );

        let ids = || resources.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        match (resource_type, action) {
            (ResourceType::Instance, _) => self.instances(action, region, ids()).await,
            (ResourceType::VpcEndpoint, LifecycleAction::Delete) => {
                self.delete_vpc_endpoints(region, ids()).await
            }
            _ => {
                for resource in resources {
                    self.perform_one(action, resource).await?;
                }
                Ok(())
            }
        }
    }
}

fn unsupported(resource_type: ResourceType, action: LifecycleAction) -> WardenError {
    WardenError::ActionFailed(format!(
        "{} does not support {}",
        resource_type.display_name(),
        action
    ))
}

fn required_arn(resource: &CloudResource) -> Result<&str> {
    resource.attribute_str(attr::ARN).ok_or_else(|| {
        WardenError::ActionFailed(format!("{} has no ARN recorded", resource.key()))
    })
}

/// Outcome of a step that clears the way for a delete
///
/// A target that is already gone is not the delete's outcome; only the
/// final call may report not-found or already-in-state.
fn tolerate_gone<T>(result: Result<T>, step: &str, id: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_idempotent_success() => {
            debug!(step, id, error = %e, "Preparatory target already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// The allow-all egress rule every new group starts with
fn is_default_egress(permission: &IpPermission) -> bool {
    permission.ip_protocol() == Some("-1")
        && permission.user_id_group_pairs().is_empty()
        && permission.prefix_list_ids().is_empty()
        && permission
            .ip_ranges()
            .iter()
            .all(|r| r.cidr_ip() == Some("0.0.0.0/0"))
        && permission
            .ipv6_ranges()
            .iter()
            .all(|r| r.cidr_ipv6() == Some("::/0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_config::BehaviorVersion;
    use aws_sdk_ec2::types::{IpRange, UserIdGroupPair};
    use serde_json::json;

    fn offline_actions() -> AwsActions {
        let config = aws_config::SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        AwsActions::new(AwsContext::from_config(config))
    }

    #[test]
    fn test_default_egress_is_kept() {
        let allow_all = IpPermission::builder()
            .ip_protocol("-1")
            .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
            .build();
        assert!(is_default_egress(&allow_all));
    }

    #[test]
    fn test_group_reference_egress_is_revoked() {
        let to_group = IpPermission::builder()
            .ip_protocol("-1")
            .user_id_group_pairs(UserIdGroupPair::builder().group_id("sg-2").build())
            .build();
        assert!(!is_default_egress(&to_group));

        let https_only = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(443)
            .to_port(443)
            .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
            .build();
        assert!(!is_default_egress(&https_only));
    }

    #[test]
    fn test_required_arn() {
        let lb = CloudResource::new("api-lb", ResourceType::LoadBalancer, "us-west-2");
        assert!(matches!(
            required_arn(&lb),
            Err(WardenError::ActionFailed(_))
        ));

        let lb = lb.with_attribute(attr::ARN, json!("arn:aws:elasticloadbalancing:lb/api"));
        assert_eq!(
            required_arn(&lb).unwrap(),
            "arn:aws:elasticloadbalancing:lb/api"
        );
    }

    #[test]
    fn test_preparatory_steps_tolerate_gone_targets() {
        let gone: Result<()> = Err(WardenError::ResourceNotFound("NoSuchEntity".into()));
        tokio_test::assert_ok!(tolerate_gone(gone, "detach_role_policy", "arn:aws:iam::policy/p"));

        let detached: Result<()> = Err(WardenError::AlreadyInState(
            "InvalidAssociationID.NotFound".into(),
        ));
        tokio_test::assert_ok!(tolerate_gone(detached, "disassociate_route_table", "rtbassoc-1"));

        tokio_test::assert_ok!(tolerate_gone(Ok(42), "delete_role_policy", "inline"));
    }

    #[test]
    fn test_preparatory_failures_still_propagate() {
        let busy: Result<()> = Err(WardenError::ResourceBusy("DependencyViolation".into()));
        assert!(matches!(
            tolerate_gone(busy, "remove_role_from_instance_profile", "worker-profile"),
            Err(WardenError::ResourceBusy(_))
        ));

        let denied: Result<()> = Err(WardenError::ApiError("AccessDenied".into()));
        assert!(matches!(
            tolerate_gone(denied, "detach_role_policy", "arn:aws:iam::policy/p"),
            Err(WardenError::ApiError(_))
        ));
    }

    #[test]
    fn test_classified_not_found_is_tolerated() {
        let err: WardenError =
            classify_aws_error(Some("NoSuchEntity"), Some("role policy gone")).into();
        tokio_test::assert_ok!(tolerate_gone::<()>(Err(err), "delete_role_policy", "inline"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let actions = offline_actions();
        tokio_test::assert_ok!(actions.perform(LifecycleAction::Delete, &[]).await);
        assert_eq!(actions.name(), "aws");
    }

    #[tokio::test]
    async fn test_unsupported_pair_fails_without_calling_out() {
        let actions = offline_actions();
        let vpc = CloudResource::new("vpc-1", ResourceType::Vpc, "us-west-2");

        let err = actions
            .perform(LifecycleAction::Stop, &[vpc])
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ActionFailed(_)));
        assert!(err.to_string().contains("VPC does not support stop"));
    }
}
