//! Tag keys and the normalized tag index
//!
//! Every ownership and expiration decision is made against a [`TagIndex`],
//! never against a provider's raw tag list.
//!
//! ## Well-known keys
//!
//! | Tag Key | Meaning |
//! |---------|---------|
//! | `Name` | Human-readable resource name |
//! | `api.openshift.com/name` | Hosted-control-plane cluster name (worker compute) |
//! | `api.openshift.com/id` | Managed cluster id (classic control-plane load balancers) |
//! | `prow.k8s.io/build-id` | CI build that provisioned an ephemeral environment |
//! | `prow.k8s.io/job` | CI job that provisioned a global resource |
//! | `expirationDate` | ISO-8601 expiration timestamp |
//! | `red-hat-clustertype` | Marks resources claimed by the managed-service scheme |
//! | `KubernetesCluster` | Volume owned by an in-cluster storage subsystem |
//! | `kubernetes.io/cluster/<infra-id>` | Per-cluster ownership map (`owned` / `shared`) |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const TAG_NAME: &str = "Name";

pub const TAG_HCP_CLUSTER_NAME: &str = "api.openshift.com/name";

pub const TAG_CLUSTER_ID: &str = "api.openshift.com/id";

pub const TAG_BUILD_ID: &str = "prow.k8s.io/build-id";

pub const TAG_JOB: &str = "prow.k8s.io/job";

pub const TAG_EXPIRATION_DATE: &str = "expirationDate";

pub const TAG_CLUSTER_TYPE: &str = "red-hat-clustertype";

pub const TAG_KUBERNETES_CLUSTER: &str = "KubernetesCluster";

/// Prefix of the dynamic per-cluster ownership-map keys
pub const CLUSTER_OWNERSHIP_PREFIX: &str = "kubernetes.io/cluster/";

/// Ownership-map value for resources the cluster created and may delete
pub const OWNED: &str = "owned";

/// Normalized key → value view over a resource's tags
///
/// Providers may return the same key more than once; the last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagIndex {
    tags: HashMap<String, String>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse an ordered sequence of `(key, value)` pairs, last write wins
    pub fn index<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut index = Self::new();
        for (key, value) in tags {
            index.insert(key, value);
        }
        index
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, sorted by key
    pub fn matches_prefix(&self, prefix: &str) -> Vec<(&str, &str)> {
        let mut matches: Vec<(&str, &str)> = self
            .tags
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        matches.sort_unstable();
        matches
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for TagIndex
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::index(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let index = TagIndex::index([
            (TAG_NAME, "first"),
            (TAG_BUILD_ID, "1234"),
            (TAG_NAME, "second"),
        ]);

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(TAG_NAME), Some("second"));
    }

    #[test]
    fn test_get_with_default() {
        let index = TagIndex::index([(TAG_JOB, "e2e-aws")]);

        assert_eq!(index.get_or(TAG_JOB, "none"), "e2e-aws");
        assert_eq!(index.get_or(TAG_BUILD_ID, "none"), "none");
        assert!(!index.has(TAG_BUILD_ID));
    }

    #[test]
    fn test_matches_prefix_enumerates_dynamic_keys() {
        let index = TagIndex::index([
            ("kubernetes.io/cluster/alpha-x7k2p", OWNED),
            ("kubernetes.io/cluster/beta-q9w3e", "shared"),
            (TAG_NAME, "alpha-x7k2p-worker-a"),
        ]);

        let matches = index.matches_prefix(CLUSTER_OWNERSHIP_PREFIX);
        assert_eq!(
            matches,
            vec![
                ("kubernetes.io/cluster/alpha-x7k2p", "owned"),
                ("kubernetes.io/cluster/beta-q9w3e", "shared"),
            ]
        );
    }

    #[test]
    fn test_empty_index() {
        let index: TagIndex = Vec::<(String, String)>::new().into_iter().collect();
        assert!(index.is_empty());
        assert!(index.matches_prefix("").is_empty());
    }
}
