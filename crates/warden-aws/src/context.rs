//! Shared AWS configuration
//!
//! The SDK config is loaded once; service clients are built from it per
//! region on demand.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;

/// Loaded AWS configuration plus per-region client construction
///
/// # Example
/// ```ignore
/// let aws = AwsContext::load().await;
/// let ec2 = aws.ec2("us-west-2");
/// let iam = aws.iam();
/// ```
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
}

impl AwsContext {
    /// Load credentials and defaults from the environment, profile files
    /// and instance metadata
    pub async fn load() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::from_config(config)
    }

    pub fn from_config(config: SdkConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn sdk_config(&self) -> &SdkConfig {
        &self.config
    }

    /// Region the config resolved to, if any
    pub fn default_region(&self) -> Option<&str> {
        self.config.region().map(|r| r.as_ref())
    }

    pub fn ec2(&self, region: &str) -> aws_sdk_ec2::Client {
        let mut builder = aws_sdk_ec2::config::Builder::from(self.sdk_config());
        if !region.is_empty() {
            builder = builder.region(Region::new(region.to_string()));
        }
        aws_sdk_ec2::Client::from_conf(builder.build())
    }

    /// Classic ELB client
    pub fn elb(&self, region: &str) -> aws_sdk_elasticloadbalancing::Client {
        let mut builder = aws_sdk_elasticloadbalancing::config::Builder::from(self.sdk_config());
        if !region.is_empty() {
            builder = builder.region(Region::new(region.to_string()));
        }
        aws_sdk_elasticloadbalancing::Client::from_conf(builder.build())
    }

    pub fn elbv2(&self, region: &str) -> aws_sdk_elasticloadbalancingv2::Client {
        let mut builder = aws_sdk_elasticloadbalancingv2::config::Builder::from(self.sdk_config());
        if !region.is_empty() {
            builder = builder.region(Region::new(region.to_string()));
        }
        aws_sdk_elasticloadbalancingv2::Client::from_conf(builder.build())
    }

    /// IAM is global
    pub fn iam(&self) -> aws_sdk_iam::Client {
        aws_sdk_iam::Client::new(self.sdk_config())
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.default_region())
            .finish_non_exhaustive()
    }
}
