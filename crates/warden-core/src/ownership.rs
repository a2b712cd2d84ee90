//! Ownership resolution
//!
//! Decides whether a resource provably belongs to an [`Owner`]. Rules are
//! evaluated in order and the first rule that applies decides:
//!
//! 1. **Identity tag.** A type-specific identity tag (`api.openshift.com/name`,
//!    `api.openshift.com/id`, `prow.k8s.io/build-id`) must equal the owner's key.
//!    A mismatch is final; no later rule can override it.
//! 2. **Ownership-map tag.** `kubernetes.io/cluster/<candidate>-<suffix>=owned`
//!    proves ownership iff `candidate` is the owner's cluster segment and no
//!    other tagging scheme claims the resource.
//! 3. **Naming prefix.** For types that allow it, a resource claimed by no
//!    other scheme whose name starts with `<prefix>-` is owned.
//! 4. **Bypass.** Types the platform often leaves untagged are owned when they
//!    carry no identity tag. The verdict is flagged as unverified.
//! 5. Otherwise the resource is not owned.

use crate::error::{Result, WardenError};
use crate::owner::{Owner, OwnerKind};
use crate::resource::{CloudResource, ResourceType};
use crate::tags::{
    CLUSTER_OWNERSHIP_PREFIX, OWNED, TAG_BUILD_ID, TAG_CLUSTER_ID, TAG_CLUSTER_TYPE,
    TAG_HCP_CLUSTER_NAME,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-type switches for the fallback rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipPolicy {
    /// Types owned by default when no identity tag is present (rule 4)
    pub bypass_types: BTreeSet<ResourceType>,

    /// Types the naming-prefix fallback applies to (rule 3)
    pub prefix_fallback_types: BTreeSet<ResourceType>,
}

impl Default for OwnershipPolicy {
    fn default() -> Self {
        Self {
            bypass_types: [
                ResourceType::SecurityGroup,
                ResourceType::ClassicLoadBalancer,
                ResourceType::RouteTable,
            ]
            .into_iter()
            .collect(),
            prefix_fallback_types: ResourceType::ALL
                .into_iter()
                .filter(|ty| !matches!(ty, ResourceType::Instance | ResourceType::Volume))
                .collect(),
        }
    }
}

impl OwnershipPolicy {
    /// Policy with every fallback disabled; only tags prove ownership
    pub fn strict() -> Self {
        Self {
            bypass_types: BTreeSet::new(),
            prefix_fallback_types: BTreeSet::new(),
        }
    }
}

/// How ownership was proven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    IdentityTag,
    OwnershipMapTag,
    NamingPrefix,
    /// Owned only because the type is on the bypass list
    Bypass,
}

impl Ownership {
    /// Bypass verdicts carry a warning; nothing positively proved ownership
    pub fn is_unverified(&self) -> bool {
        matches!(self, Ownership::Bypass)
    }
}

/// Identity tag consulted by rule 1 for an owner kind and resource type
pub fn identity_tag(kind: OwnerKind, resource_type: ResourceType) -> Option<&'static str> {
    match (kind, resource_type) {
        (OwnerKind::CiBuild, _) => Some(TAG_BUILD_ID),
        (OwnerKind::Cluster, ResourceType::Instance | ResourceType::Volume) => {
            Some(TAG_HCP_CLUSTER_NAME)
        }
        (
            OwnerKind::Cluster,
            ResourceType::LoadBalancer | ResourceType::ClassicLoadBalancer,
        ) => Some(TAG_CLUSTER_ID),
        _ => None,
    }
}

/// Cluster segment of an ownership-map key (`kubernetes.io/cluster/foo-x7k2p` → `foo`)
fn ownership_map_candidate(key: &str) -> Option<&str> {
    key.strip_prefix(CLUSTER_OWNERSHIP_PREFIX)
        .and_then(|infra_id| infra_id.rsplit_once('-'))
        .map(|(candidate, _suffix)| candidate)
}

/// Resource is already claimed by a different resolution scheme
fn claimed_by_other_scheme(resource: &CloudResource) -> bool {
    resource.tags.has(TAG_CLUSTER_TYPE) || resource.tags.has(TAG_HCP_CLUSTER_NAME)
}

#[derive(Debug, Clone, Default)]
pub struct OwnershipResolver {
    policy: OwnershipPolicy,
}

impl OwnershipResolver {
    pub fn new(policy: OwnershipPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &OwnershipPolicy {
        &self.policy
    }

    pub fn belongs_to(&self, resource: &CloudResource, owner: &Owner) -> bool {
        self.prove(resource, owner).is_ok()
    }

    /// Prove that `resource` belongs to `owner`, or say why it cannot be proven
    pub fn prove(&self, resource: &CloudResource, owner: &Owner) -> Result<Ownership> {
        let unprovable = |reason: String| {
            Err(WardenError::UnprovableOwnership {
                resource_id: resource.id.clone(),
                reason,
            })
        };

        if owner.key.is_empty() && owner.kind == OwnerKind::CiBuild {
            return unprovable("owner carries no build identifier".to_string());
        }

        // Rule 1
        if let Some(tag) = identity_tag(owner.kind, resource.resource_type) {
            if let Some(value) = resource.tags.get(tag) {
                let expected = owner.identity_value(tag);
                if !expected.is_empty() && value == expected {
                    return Ok(Ownership::IdentityTag);
                }
                return unprovable(format!("{tag}={value} names a different owner"));
            }
        }

        let segment = owner.cluster_segment();
        if !segment.is_empty() {
            // Rule 2
            let claims: Vec<&str> = resource
                .tags
                .matches_prefix(CLUSTER_OWNERSHIP_PREFIX)
                .into_iter()
                .filter(|(_, value)| *value == OWNED)
                .map(|(key, _)| key)
                .collect();
            if !claims.is_empty() {
                let ours = claims
                    .iter()
                    .any(|key| ownership_map_candidate(key) == Some(segment));
                if ours && !claimed_by_other_scheme(resource) {
                    return Ok(Ownership::OwnershipMapTag);
                }
                return unprovable(format!("owned by {}", claims.join(", ")));
            }

            // Rule 3
            if self
                .policy
                .prefix_fallback_types
                .contains(&resource.resource_type)
                && !claimed_by_other_scheme(resource)
                && resource
                    .name()
                    .is_some_and(|name| name.starts_with(&format!("{segment}-")))
            {
                return Ok(Ownership::NamingPrefix);
            }
        }

        // Rule 4
        if self.policy.bypass_types.contains(&resource.resource_type) {
            tracing::warn!(
                resource_id = %resource.id,
                resource_type = %resource.resource_type,
                owner = %owner,
                "{} has no identity tag, treating as owned",
                resource.resource_type.display_name()
            );
            return Ok(Ownership::Bypass);
        }

        unprovable("no ownership evidence".to_string())
    }

    /// Reason the resource's identity tag names a different owner, if it does
    pub fn identity_conflict(&self, resource: &CloudResource, owner: &Owner) -> Option<String> {
        let tag = identity_tag(owner.kind, resource.resource_type)?;
        let value = resource.tags.get(tag)?;
        (value != owner.identity_value(tag))
            .then(|| format!("{tag}={value} names a different owner"))
    }
}
