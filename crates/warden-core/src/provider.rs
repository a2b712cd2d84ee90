//! Cloud collaborator traits
//!
//! The engine never talks to a cloud SDK directly. It reads through an
//! [`Inventory`] and mutates through an [`ActionApi`], both handed in
//! explicitly as a [`CloudClientSet`].

use crate::action::LifecycleAction;
use crate::error::Result;
use crate::poller::ObservedState;
use crate::resource::{CloudResource, ResourceType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Read side of a cloud account
///
/// Listings are assumed consistent enough; the engine does not retry them.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// List resources of one type in a region (empty region for global types)
    ///
    /// `state_filter` narrows to a provider lifecycle state such as `"running"`.
    async fn list_resources(
        &self,
        resource_type: ResourceType,
        region: &str,
        state_filter: Option<&str>,
    ) -> Result<Vec<CloudResource>>;

    /// Current state (and health, where the type has one) of specific resources
    ///
    /// Resources that no longer exist are simply absent from the result.
    async fn observe(
        &self,
        resource_type: ResourceType,
        region: &str,
        ids: &[String],
    ) -> Result<Vec<ObservedState>>;
}

/// Write side of a cloud account
///
/// One call per invocation; success or failure is reported for the whole
/// call, never per resource. Implementations report "already gone" as
/// `ResourceNotFound` and "already there" as `AlreadyInState`.
#[async_trait]
pub trait ActionApi: Send + Sync {
    /// Returns the provider name (e.g., "aws")
    fn name(&self) -> &str;

    /// Apply `action` to every resource in `resources` (all of one type)
    async fn perform(&self, action: LifecycleAction, resources: &[CloudResource]) -> Result<()>;
}

/// Explicit handles to the cloud, passed in at construction
#[derive(Clone)]
pub struct CloudClientSet {
    pub inventory: Arc<dyn Inventory>,
    pub actions: Arc<dyn ActionApi>,
}

impl CloudClientSet {
    pub fn new(inventory: Arc<dyn Inventory>, actions: Arc<dyn ActionApi>) -> Self {
        Self { inventory, actions }
    }
}

impl std::fmt::Debug for CloudClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClientSet")
            .field("actions", &self.actions.name())
            .finish_non_exhaustive()
    }
}

/// Retry configuration for eventually-consistent provider operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// A volume still settling from a detach: 7 attempts, 5 s apart
    pub fn volume_delete() -> Self {
        Self::fixed(7, Duration::from_secs(5))
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_retry_delay_is_constant() {
        let retry = RetryConfig::volume_delete();
        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(6), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(30));
    }
}
