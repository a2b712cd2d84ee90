//! Cloud resource snapshots
//!
//! A [`CloudResource`] is a point-in-time view produced by an inventory
//! listing. It is never persisted and never mutated by the engine.

use crate::tags::{TAG_NAME, TagIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known keys in [`CloudResource::attributes`]
pub mod attr {
    /// Provider-side name (load balancer name, IAM role name, ...)
    pub const NAME: &str = "name";
    /// Security group name; `default` groups are never deleted
    pub const GROUP_NAME: &str = "group_name";
    /// Route table is the VPC's main table
    pub const IS_MAIN: &str = "is_main";
    /// Elastic IP association id, present while associated
    pub const ASSOCIATION_ID: &str = "association_id";
    pub const PUBLIC_IP: &str = "public_ip";
    /// Instance a volume is attached to
    pub const ATTACHED_INSTANCE: &str = "attached_instance";
    /// Device name of a volume attachment
    pub const DEVICE: &str = "device";
    pub const DELETE_ON_TERMINATION: &str = "delete_on_termination";
    /// VPC an internet gateway is attached to
    pub const ATTACHED_VPC: &str = "attached_vpc";
    /// ARN for resources addressed by ARN (ELBv2, OIDC providers)
    pub const ARN: &str = "arn";
}

/// Kinds of resources the engine can reason about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Instance,
    Volume,
    NetworkInterface,
    SecurityGroup,
    Subnet,
    RouteTable,
    InternetGateway,
    NatGateway,
    VpcEndpoint,
    ElasticIp,
    /// Application / network load balancer (ELBv2)
    LoadBalancer,
    /// Classic ELB
    ClassicLoadBalancer,
    Vpc,
    IamRole,
    InstanceProfile,
    OidcProvider,
}

impl ResourceType {
    pub const ALL: [ResourceType; 16] = [
        ResourceType::Instance,
        ResourceType::Volume,
        ResourceType::NetworkInterface,
        ResourceType::SecurityGroup,
        ResourceType::Subnet,
        ResourceType::RouteTable,
        ResourceType::InternetGateway,
        ResourceType::NatGateway,
        ResourceType::VpcEndpoint,
        ResourceType::ElasticIp,
        ResourceType::LoadBalancer,
        ResourceType::ClassicLoadBalancer,
        ResourceType::Vpc,
        ResourceType::IamRole,
        ResourceType::InstanceProfile,
        ResourceType::OidcProvider,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Instance => "instance",
            ResourceType::Volume => "volume",
            ResourceType::NetworkInterface => "network_interface",
            ResourceType::SecurityGroup => "security_group",
            ResourceType::Subnet => "subnet",
            ResourceType::RouteTable => "route_table",
            ResourceType::InternetGateway => "internet_gateway",
            ResourceType::NatGateway => "nat_gateway",
            ResourceType::VpcEndpoint => "vpc_endpoint",
            ResourceType::ElasticIp => "elastic_ip",
            ResourceType::LoadBalancer => "load_balancer",
            ResourceType::ClassicLoadBalancer => "classic_load_balancer",
            ResourceType::Vpc => "vpc",
            ResourceType::IamRole => "iam_role",
            ResourceType::InstanceProfile => "instance_profile",
            ResourceType::OidcProvider => "oidc_provider",
        }
    }

    /// Name used in log lines and dry-run output
    pub fn display_name(&self) -> &'static str {
        match self {
            ResourceType::Instance => "Instance",
            ResourceType::Volume => "Volume",
            ResourceType::NetworkInterface => "Network Interface",
            ResourceType::SecurityGroup => "Security Group",
            ResourceType::Subnet => "Subnet",
            ResourceType::RouteTable => "Route Table",
            ResourceType::InternetGateway => "Internet Gateway",
            ResourceType::NatGateway => "NAT Gateway",
            ResourceType::VpcEndpoint => "VPC Endpoint",
            ResourceType::ElasticIp => "Elastic IP",
            ResourceType::LoadBalancer => "Load Balancer",
            ResourceType::ClassicLoadBalancer => "Classic Load Balancer",
            ResourceType::Vpc => "VPC",
            ResourceType::IamRole => "IAM Role",
            ResourceType::InstanceProfile => "Instance Profile",
            ResourceType::OidcProvider => "OIDC Provider",
        }
    }

    /// Global resources have no region
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            ResourceType::IamRole | ResourceType::InstanceProfile | ResourceType::OidcProvider
        )
    }

    /// Types whose provider calls accept many ids at once
    pub fn supports_batch(&self) -> bool {
        matches!(self, ResourceType::Instance | ResourceType::VpcEndpoint)
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a single cloud resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudResource {
    /// Provider-assigned id, unique within region + type
    pub id: String,

    pub resource_type: ResourceType,

    /// Empty for global resources
    pub region: String,

    pub tags: TagIndex,

    /// Provider-reported lifecycle state ("running", "available", ...)
    pub state: String,

    /// Owning VPC, for lookup only; never an ownership edge
    pub parent_vpc: Option<String>,

    /// Provider facts the planner needs (see [`attr`])
    pub attributes: HashMap<String, serde_json::Value>,
}

impl CloudResource {
    pub fn new(
        id: impl Into<String>,
        resource_type: ResourceType,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type,
            region: region.into(),
            tags: TagIndex::new(),
            state: String::new(),
            parent_vpc: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_tags(mut self, tags: TagIndex) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn with_parent_vpc(mut self, vpc_id: impl Into<String>) -> Self {
        self.parent_vpc = Some(vpc_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Boolean attribute, `false` when missing
    pub fn flag(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// `Name` tag, falling back to the provider-side name
    pub fn name(&self) -> Option<&str> {
        self.tags
            .get(TAG_NAME)
            .or_else(|| self.attribute_str(attr::NAME))
    }

    pub fn is_in_vpc(&self, vpc_id: &str) -> bool {
        self.parent_vpc.as_deref() == Some(vpc_id)
    }

    /// Full resource key (type:id)
    pub fn key(&self) -> String {
        format!("{}:{}", self.resource_type, self.id)
    }
}
