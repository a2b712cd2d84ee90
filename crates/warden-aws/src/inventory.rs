//! Read side: listing and observing AWS resources
//!
//! Every listing normalizes provider tags into a [`TagIndex`] and records
//! the owning VPC as a lookup field. Nothing here decides ownership.

use crate::context::AwsContext;
use crate::error::{classify_sdk_error, sdk};
use async_trait::async_trait;
use aws_sdk_ec2::types::Filter;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;
use warden_core::resource::attr;
use warden_core::{
    CloudResource, HealthStatus, Inventory, ObservedState, ResourceType, Result, TagIndex,
    WardenError,
};

/// Describe-tags calls accept at most this many names or ARNs
const ELB_TAG_BATCH: usize = 20;

const OIDC_ARN_MARKER: &str = ":oidc-provider/";

/// [`Inventory`] backed by the EC2, ELB, ELBv2 and IAM APIs
#[derive(Debug, Clone)]
pub struct AwsInventory {
    ctx: AwsContext,
}

impl AwsInventory {
    pub fn new(ctx: AwsContext) -> Self {
        Self { ctx }
    }

    async fn list_instances(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_instances().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for instance in page.reservations().iter().flat_map(|r| r.instances()) {
                let Some(id) = instance.instance_id() else {
                    continue;
                };
                let state = instance
                    .state()
                    .and_then(|s| s.name())
                    .map(|n| n.as_str())
                    .unwrap_or_default();
                let resource = CloudResource::new(id, ResourceType::Instance, region)
                    .with_state(state)
                    .with_tags(ec2_tags(instance.tags()));
                resources.push(with_vpc(resource, instance.vpc_id()));
            }
        }
        Ok(resources)
    }

    async fn list_volumes(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_volumes().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for volume in page.volumes() {
                let Some(id) = volume.volume_id() else {
                    continue;
                };
                let mut resource = CloudResource::new(id, ResourceType::Volume, region)
                    .with_state(volume.state().map(|s| s.as_str()).unwrap_or_default())
                    .with_tags(ec2_tags(volume.tags()));

                if let Some(attachment) = volume.attachments().first() {
                    if let Some(instance_id) = attachment.instance_id() {
                        resource =
                            resource.with_attribute(attr::ATTACHED_INSTANCE, json!(instance_id));
                    }
                    if let Some(device) = attachment.device() {
                        resource = resource.with_attribute(attr::DEVICE, json!(device));
                    }
                    resource = resource.with_attribute(
                        attr::DELETE_ON_TERMINATION,
                        json!(attachment.delete_on_termination().unwrap_or(false)),
                    );
                }
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    async fn list_network_interfaces(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_network_interfaces().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for eni in page.network_interfaces() {
                let Some(id) = eni.network_interface_id() else {
                    continue;
                };
                let resource = CloudResource::new(id, ResourceType::NetworkInterface, region)
                    .with_state(eni.status().map(|s| s.as_str()).unwrap_or_default())
                    .with_tags(ec2_tags(eni.tag_set()));
                resources.push(with_vpc(resource, eni.vpc_id()));
            }
        }
        Ok(resources)
    }

    async fn list_security_groups(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_security_groups().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for group in page.security_groups() {
                let Some(id) = group.group_id() else {
                    continue;
                };
                let mut resource = CloudResource::new(id, ResourceType::SecurityGroup, region)
                    .with_tags(ec2_tags(group.tags()));
                if let Some(name) = group.group_name() {
                    resource = resource.with_attribute(attr::GROUP_NAME, json!(name));
                }
                resources.push(with_vpc(resource, group.vpc_id()));
            }
        }
        Ok(resources)
    }

    async fn list_subnets(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_subnets().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for subnet in page.subnets() {
                let Some(id) = subnet.subnet_id() else {
                    continue;
                };
                let resource = CloudResource::new(id, ResourceType::Subnet, region)
                    .with_state(subnet.state().map(|s| s.as_str()).unwrap_or_default())
                    .with_tags(ec2_tags(subnet.tags()));
                resources.push(with_vpc(resource, subnet.vpc_id()));
            }
        }
        Ok(resources)
    }

    async fn list_route_tables(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_route_tables().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for table in page.route_tables() {
                let Some(id) = table.route_table_id() else {
                    continue;
                };
                let is_main = table
                    .associations()
                    .iter()
                    .any(|a| a.main().unwrap_or(false));
                let resource = CloudResource::new(id, ResourceType::RouteTable, region)
                    .with_tags(ec2_tags(table.tags()))
                    .with_attribute(attr::IS_MAIN, json!(is_main));
                resources.push(with_vpc(resource, table.vpc_id()));
            }
        }
        Ok(resources)
    }

    async fn list_internet_gateways(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_internet_gateways().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for gateway in page.internet_gateways() {
                let Some(id) = gateway.internet_gateway_id() else {
                    continue;
                };
                let mut resource = CloudResource::new(id, ResourceType::InternetGateway, region)
                    .with_state("detached")
                    .with_tags(ec2_tags(gateway.tags()));

                let attachment = gateway.attachments().first();
                if let Some(vpc_id) = attachment.and_then(|a| a.vpc_id()) {
                    let state = attachment
                        .and_then(|a| a.state())
                        .map(|s| s.as_str())
                        .unwrap_or("attached");
                    resource = resource
                        .with_state(state)
                        .with_parent_vpc(vpc_id)
                        .with_attribute(attr::ATTACHED_VPC, json!(vpc_id));
                }
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    async fn list_nat_gateways(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_nat_gateways().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for gateway in page.nat_gateways() {
                let Some(id) = gateway.nat_gateway_id() else {
                    continue;
                };
                let resource = CloudResource::new(id, ResourceType::NatGateway, region)
                    .with_state(gateway.state().map(|s| s.as_str()).unwrap_or_default())
                    .with_tags(ec2_tags(gateway.tags()));
                resources.push(with_vpc(resource, gateway.vpc_id()));
            }
        }
        Ok(resources)
    }

    async fn list_vpc_endpoints(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_vpc_endpoints().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for endpoint in page.vpc_endpoints() {
                let Some(id) = endpoint.vpc_endpoint_id() else {
                    continue;
                };
                let resource = CloudResource::new(id, ResourceType::VpcEndpoint, region)
                    .with_state(endpoint.state().map(|s| s.as_str()).unwrap_or_default())
                    .with_tags(ec2_tags(endpoint.tags()));
                resources.push(with_vpc(resource, endpoint.vpc_id()));
            }
        }
        Ok(resources)
    }

    /// Elastic IPs carry no VPC id; it comes from whatever they are
    /// associated with
    async fn list_addresses(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let (response, instances, interfaces) = tokio::try_join!(
            async { client.describe_addresses().send().await.map_err(sdk) },
            self.list_instances(region),
            self.list_network_interfaces(region),
        )?;

        let vpc_of: HashMap<String, String> = instances
            .into_iter()
            .chain(interfaces)
            .filter_map(|r| r.parent_vpc.map(|vpc| (r.id, vpc)))
            .collect();

        let mut resources = Vec::new();
        for address in response.addresses() {
            let Some(id) = address.allocation_id() else {
                continue;
            };
            let mut resource = CloudResource::new(id, ResourceType::ElasticIp, region)
                .with_state(if address.association_id().is_some() {
                    "associated"
                } else {
                    "unassociated"
                })
                .with_tags(ec2_tags(address.tags()));

            if let Some(ip) = address.public_ip() {
                resource = resource.with_attribute(attr::PUBLIC_IP, json!(ip));
            }
            if let Some(association_id) = address.association_id() {
                resource = resource.with_attribute(attr::ASSOCIATION_ID, json!(association_id));
            }

            let vpc = address
                .instance_id()
                .and_then(|id| vpc_of.get(id))
                .or_else(|| address.network_interface_id().and_then(|id| vpc_of.get(id)));
            if let Some(vpc_id) = vpc {
                resource = resource.with_parent_vpc(vpc_id.clone());
            }
            resources.push(resource);
        }
        Ok(resources)
    }

    async fn list_vpcs(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.ec2(region);
        let mut pages = client.describe_vpcs().into_paginator().send();
        let mut resources = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk)?;
            for vpc in page.vpcs() {
                let Some(id) = vpc.vpc_id() else {
                    continue;
                };
                resources.push(
                    CloudResource::new(id, ResourceType::Vpc, region)
                        .with_state(vpc.state().map(|s| s.as_str()).unwrap_or_default())
                        .with_tags(ec2_tags(vpc.tags())),
                );
            }
        }
        Ok(resources)
    }

    /// Classic load balancers are addressed by name
    async fn list_classic_load_balancers(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.elb(region);
        let mut resources = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = client
                .describe_load_balancers()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(sdk)?;

            for lb in response.load_balancer_descriptions() {
                let Some(name) = lb.load_balancer_name() else {
                    continue;
                };
                let resource = CloudResource::new(name, ResourceType::ClassicLoadBalancer, region)
                    .with_state("active")
                    .with_attribute(attr::NAME, json!(name));
                resources.push(with_vpc(resource, lb.vpc_id()));
            }

            match response.next_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        let names: Vec<String> = resources.iter().map(|r| r.id.clone()).collect();
        let mut tags_by_name: HashMap<String, TagIndex> = HashMap::new();
        for chunk in names.chunks(ELB_TAG_BATCH) {
            let response = client
                .describe_tags()
                .set_load_balancer_names(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(sdk)?;
            for description in response.tag_descriptions() {
                if let Some(name) = description.load_balancer_name() {
                    let tags = description
                        .tags()
                        .iter()
                        .map(|t| (t.key(), t.value().unwrap_or_default()))
                        .collect();
                    tags_by_name.insert(name.to_string(), tags);
                }
            }
        }

        for resource in &mut resources {
            if let Some(tags) = tags_by_name.remove(&resource.id) {
                resource.tags = tags;
            }
        }
        Ok(resources)
    }

    /// ELBv2 load balancers keep their ARN in [`attr::ARN`]; the id is the name
    async fn list_load_balancers(&self, region: &str) -> Result<Vec<CloudResource>> {
        let client = self.ctx.elbv2(region);
        let mut resources = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = client
                .describe_load_balancers()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(sdk)?;

            for lb in response.load_balancers() {
                let (Some(name), Some(arn)) = (lb.load_balancer_name(), lb.load_balancer_arn())
                else {
                    continue;
                };
                let state = lb
                    .state()
                    .and_then(|s| s.code())
                    .map(|c| c.as_str())
                    .unwrap_or_default();
                let resource = CloudResource::new(name, ResourceType::LoadBalancer, region)
                    .with_state(state)
                    .with_attribute(attr::NAME, json!(name))
                    .with_attribute(attr::ARN, json!(arn));
                resources.push(with_vpc(resource, lb.vpc_id()));
            }

            match response.next_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        let arns: Vec<String> = resources
            .iter()
            .filter_map(|r| r.attribute_str(attr::ARN).map(str::to_string))
            .collect();
        let mut tags_by_arn: HashMap<String, TagIndex> = HashMap::new();
        for chunk in arns.chunks(ELB_TAG_BATCH) {
            let response = client
                .describe_tags()
                .set_resource_arns(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(sdk)?;
            for description in response.tag_descriptions() {
                if let Some(arn) = description.resource_arn() {
                    let tags = description
                        .tags()
                        .iter()
                        .map(|t| (t.key(), t.value().unwrap_or_default()))
                        .collect();
                    tags_by_arn.insert(arn.to_string(), tags);
                }
            }
        }

        for resource in &mut resources {
            let tags = resource
                .attribute_str(attr::ARN)
                .and_then(|arn| tags_by_arn.remove(arn));
            if let Some(tags) = tags {
                resource.tags = tags;
            }
        }
        Ok(resources)
    }

    async fn list_iam_roles(&self) -> Result<Vec<CloudResource>> {
        let client = self.ctx.iam();
        let mut resources = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = client
                .list_roles()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(sdk)?;

            for role in response.roles() {
                let name = role.role_name();
                // Tags are not part of the listing
                let tags = match client.list_role_tags().role_name(name).send().await {
                    Ok(resp) => iam_tags(resp.tags()),
                    Err(e) => {
                        debug!(
                            role = %name,
                            error = %classify_sdk_error(&e),
                            "Could not read role tags"
                        );
                        TagIndex::new()
                    }
                };
                resources.push(
                    CloudResource::new(name, ResourceType::IamRole, "")
                        .with_tags(tags)
                        .with_attribute(attr::NAME, json!(name))
                        .with_attribute(attr::ARN, json!(role.arn())),
                );
            }

            if response.is_truncated() {
                marker = response.marker().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(resources)
    }

    async fn list_instance_profiles(&self) -> Result<Vec<CloudResource>> {
        let client = self.ctx.iam();
        let mut resources = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = client
                .list_instance_profiles()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(sdk)?;

            for profile in response.instance_profiles() {
                let name = profile.instance_profile_name();
                let tags = match client
                    .list_instance_profile_tags()
                    .instance_profile_name(name)
                    .send()
                    .await
                {
                    Ok(resp) => iam_tags(resp.tags()),
                    Err(e) => {
                        debug!(
                            profile = %name,
                            error = %classify_sdk_error(&e),
                            "Could not read instance profile tags"
                        );
                        TagIndex::new()
                    }
                };
                resources.push(
                    CloudResource::new(name, ResourceType::InstanceProfile, "")
                        .with_tags(tags)
                        .with_attribute(attr::NAME, json!(name))
                        .with_attribute(attr::ARN, json!(profile.arn())),
                );
            }

            if response.is_truncated() {
                marker = response.marker().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(resources)
    }

    /// OIDC providers are identified by the issuer part of their ARN
    async fn list_oidc_providers(&self) -> Result<Vec<CloudResource>> {
        let client = self.ctx.iam();
        let response = client
            .list_open_id_connect_providers()
            .send()
            .await
            .map_err(sdk)?;

        let mut resources = Vec::new();
        for entry in response.open_id_connect_provider_list() {
            let Some(arn) = entry.arn() else {
                continue;
            };
            let tags = client
                .list_open_id_connect_provider_tags()
                .open_id_connect_provider_arn(arn)
                .send()
                .await
                .map_err(sdk)?;
            resources.push(
                CloudResource::new(oidc_issuer(arn), ResourceType::OidcProvider, "")
                    .with_tags(iam_tags(tags.tags()))
                    .with_attribute(attr::ARN, json!(arn)),
            );
        }
        Ok(resources)
    }

    /// State plus status checks for specific instances
    ///
    /// Ids that no longer exist are left out rather than failing the call.
    async fn observe_instances(&self, region: &str, ids: &[String]) -> Result<Vec<ObservedState>> {
        let client = self.ctx.ec2(region);
        let filter = Filter::builder()
            .name("instance-id")
            .set_values(Some(ids.to_vec()))
            .build();
        let response = client
            .describe_instances()
            .filters(filter)
            .send()
            .await
            .map_err(sdk)?;

        let mut observed: Vec<ObservedState> = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| {
                let id = i.instance_id()?;
                let state = i.state().and_then(|s| s.name())?.as_str();
                Some(ObservedState::new(id, state))
            })
            .collect();
        if observed.is_empty() {
            return Ok(observed);
        }

        let present: Vec<String> = observed.iter().map(|o| o.id.clone()).collect();
        let statuses = client
            .describe_instance_status()
            .set_instance_ids(Some(present))
            .include_all_instances(true)
            .send()
            .await;
        let statuses = match statuses.map_err(sdk) {
            Ok(statuses) => statuses,
            Err(WardenError::ResourceNotFound(reason)) => {
                debug!(region, %reason, "Instance vanished between describe calls");
                return Ok(observed);
            }
            Err(e) => return Err(e),
        };

        let health: HashMap<&str, HealthStatus> = statuses
            .instance_statuses()
            .iter()
            .filter_map(|s| {
                let id = s.instance_id()?;
                let instance = s.instance_status().and_then(|x| x.status())?.as_str();
                let system = s.system_status().and_then(|x| x.status())?.as_str();
                Some((id, HealthStatus::new(instance, system)))
            })
            .collect();
        for entry in &mut observed {
            if let Some(status) = health.get(entry.id.as_str()) {
                entry.health = Some(status.clone());
            }
        }
        Ok(observed)
    }
}

#[async_trait]
impl Inventory for AwsInventory {
    async fn list_resources(
        &self,
        resource_type: ResourceType,
        region: &str,
        state_filter: Option<&str>,
    ) -> Result<Vec<CloudResource>> {
        let mut resources = match resource_type {
            ResourceType::Instance => self.list_instances(region).await?,
            ResourceType::Volume => self.list_volumes(region).await?,
            ResourceType::NetworkInterface => self.list_network_interfaces(region).await?,
            ResourceType::SecurityGroup => self.list_security_groups(region).await?,
            ResourceType::Subnet => self.list_subnets(region).await?,
            ResourceType::RouteTable => self.list_route_tables(region).await?,
            ResourceType::InternetGateway => self.list_internet_gateways(region).await?,
            ResourceType::NatGateway => self.list_nat_gateways(region).await?,
            ResourceType::VpcEndpoint => self.list_vpc_endpoints(region).await?,
            ResourceType::ElasticIp => self.list_addresses(region).await?,
            ResourceType::LoadBalancer => self.list_load_balancers(region).await?,
            ResourceType::ClassicLoadBalancer => self.list_classic_load_balancers(region).await?,
            ResourceType::Vpc => self.list_vpcs(region).await?,
            ResourceType::IamRole => self.list_iam_roles().await?,
            ResourceType::InstanceProfile => self.list_instance_profiles().await?,
            ResourceType::OidcProvider => self.list_oidc_providers().await?,
        };

        if let Some(state) = state_filter {
            resources.retain(|r| r.state == state);
        }
        debug!(
            resource_type = %resource_type,
            region,
            count = resources.len(),
            "Listed resources"
        );
        Ok(resources)
    }

    async fn observe(
        &self,
        resource_type: ResourceType,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<ObservedState>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if resource_type == ResourceType::Instance {
            return self.observe_instances(region, ids).await;
        }

        let resources = self.list_resources(resource_type, region, None).await?;
        Ok(resources
            .into_iter()
            .filter(|r| ids.contains(&r.id))
            .map(|r| ObservedState::new(r.id, r.state))
            .collect())
    }
}

fn with_vpc(resource: CloudResource, vpc_id: Option<&str>) -> CloudResource {
    match vpc_id {
        Some(vpc_id) => resource.with_parent_vpc(vpc_id),
        None => resource,
    }
}

/// EC2 tag lists, keyless entries dropped
pub(crate) fn ec2_tags(tags: &[aws_sdk_ec2::types::Tag]) -> TagIndex {
    tags.iter()
        .filter_map(|t| Some((t.key()?, t.value().unwrap_or_default())))
        .collect()
}

fn iam_tags(tags: &[aws_sdk_iam::types::Tag]) -> TagIndex {
    tags.iter().map(|t| (t.key(), t.value())).collect()
}

/// `arn:aws:iam::123:oidc-provider/issuer/path` -> `issuer/path`
pub(crate) fn oidc_issuer(arn: &str) -> &str {
    arn.split_once(OIDC_ARN_MARKER)
        .map(|(_, issuer)| issuer)
        .unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::Tag;
    use warden_core::tags::{TAG_BUILD_ID, TAG_NAME};

    #[test]
    fn test_ec2_tags_last_write_wins_and_skips_keyless() {
        let tags = vec![
            Tag::builder().key(TAG_NAME).value("first").build(),
            Tag::builder().value("orphan").build(),
            Tag::builder().key(TAG_BUILD_ID).build(),
            Tag::builder().key(TAG_NAME).value("second").build(),
        ];

        let index = ec2_tags(&tags);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(TAG_NAME), Some("second"));
        assert_eq!(index.get(TAG_BUILD_ID), Some(""));
    }

    #[test]
    fn test_oidc_issuer_from_arn() {
        assert_eq!(
            oidc_issuer("arn:aws:iam::123456789012:oidc-provider/oidc.example/ci-1001"),
            "oidc.example/ci-1001"
        );
        assert_eq!(oidc_issuer("not-an-arn"), "not-an-arn");
    }

    #[test]
    fn test_with_vpc() {
        let subnet = CloudResource::new("subnet-1", ResourceType::Subnet, "us-west-2");
        assert!(with_vpc(subnet.clone(), None).parent_vpc.is_none());
        assert!(with_vpc(subnet, Some("vpc-1")).is_in_vpc("vpc-1"));
    }
}
