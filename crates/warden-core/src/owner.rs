//! Logical owners of cloud resources

use crate::tags::TAG_CLUSTER_ID;
use serde::{Deserialize, Serialize};

/// Managed-service cluster names with four dashes are cut to this length
const SANITIZED_NAME_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Cluster,
    CiBuild,
}

/// How a cluster's worker compute lives in the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterArchitecture {
    /// Only workers live in the account, tagged with the cluster name
    HostedControlPlane,
    /// Installer-provisioned; every node carries a per-cluster ownership-map tag
    Ipi,
}

impl std::fmt::Display for ClusterArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterArchitecture::HostedControlPlane => write!(f, "hosted-control-plane"),
            ClusterArchitecture::Ipi => write!(f, "ipi"),
        }
    }
}

/// The logical owner a set of resources is resolved against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub kind: OwnerKind,

    /// Cluster name, or the `prow.k8s.io/build-id` value for CI builds
    pub key: String,

    /// Pattern-matching fallback only; empty disables prefix rules
    pub naming_prefix: String,

    /// Managed-service cluster id, compared against `api.openshift.com/id`
    pub external_id: Option<String>,
}

impl Owner {
    pub fn cluster(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: OwnerKind::Cluster,
            naming_prefix: name.clone(),
            key: name,
            external_id: None,
        }
    }

    pub fn ci_build(build_id: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::CiBuild,
            key: build_id.into(),
            naming_prefix: String::new(),
            external_id: None,
        }
    }

    /// Use a different prefix for name matching (IPI infra names differ from
    /// the cluster's display name)
    pub fn with_naming_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.naming_prefix = prefix.into();
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// The naming prefix reduced to the segment that identifies the cluster
    pub fn cluster_segment(&self) -> &str {
        self.naming_prefix.trim().trim_end_matches('-')
    }

    pub fn has_naming_prefix(&self) -> bool {
        !self.cluster_segment().is_empty()
    }

    /// Value an identity tag must carry to prove ownership
    pub fn identity_value(&self, tag_key: &str) -> &str {
        match (&self.external_id, tag_key) {
            (Some(id), TAG_CLUSTER_ID) => id,
            _ => &self.key,
        }
    }

    /// Normalize a user-supplied managed-service cluster name
    pub fn sanitize_cluster_name(name: &str) -> String {
        if name.matches('-').count() == 4 {
            name.chars().take(SANITIZED_NAME_LEN).collect()
        } else {
            name.to_string()
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            OwnerKind::Cluster => write!(f, "cluster:{}", self.key),
            OwnerKind::CiBuild => write!(f, "build:{}", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_segment_trims_trailing_dash() {
        let owner = Owner::cluster("foo-bar").with_naming_prefix("foo-bar-");
        assert_eq!(owner.cluster_segment(), "foo-bar");
        assert!(owner.has_naming_prefix());

        assert!(!Owner::ci_build("1234").has_naming_prefix());
    }

    #[test]
    fn test_identity_value_uses_external_id_for_cluster_id_tag() {
        let owner = Owner::cluster("foo").with_external_id("2abc9def");
        assert_eq!(owner.identity_value(TAG_CLUSTER_ID), "2abc9def");
        assert_eq!(
            owner.identity_value(crate::tags::TAG_HCP_CLUSTER_NAME),
            "foo"
        );
    }

    #[test]
    fn test_sanitize_cluster_name() {
        let long = "odh-nightly-rosa-hcp-cluster-us-east";
        assert_eq!(long.matches('-').count(), 6);
        assert_eq!(Owner::sanitize_cluster_name(long), long);

        let four = "data-science-pipelines-nightly-build01";
        assert_eq!(Owner::sanitize_cluster_name(four).len(), 28);
        assert_eq!(
            Owner::sanitize_cluster_name(four),
            "data-science-pipelines-night"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Owner::cluster("foo").to_string(), "cluster:foo");
        assert_eq!(Owner::ci_build("77").to_string(), "build:77");
    }
}
