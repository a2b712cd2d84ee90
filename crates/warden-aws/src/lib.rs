//! AWS backend for warden
//!
//! Implements the engine's [`Inventory`](warden_core::Inventory) and
//! [`ActionApi`](warden_core::ActionApi) seams on top of the AWS SDK.
//!
//! # Covered services
//!
//! - EC2: instances, volumes, network interfaces, security groups, subnets,
//!   route tables, internet and NAT gateways, VPC endpoints, Elastic IPs, VPCs
//! - Elastic Load Balancing (classic) and ELBv2
//! - IAM: roles, instance profiles, OIDC providers
//!
//! # Requirements
//!
//! - Credentials resolvable by the default AWS provider chain
//!
//! # Example
//!
//! ```ignore
//! use warden_aws::AwsContext;
//! use warden_core::{ClusterArchitecture, EngineSettings, LifecycleEngine, Owner};
//!
//! let clients = warden_aws::client_set(AwsContext::load().await);
//! let engine = LifecycleEngine::new(clients, EngineSettings::default());
//!
//! let report = engine
//!     .hibernate_cluster(&Owner::cluster("foo-bar"), ClusterArchitecture::HostedControlPlane, "us-west-2")
//!     .await?;
//! ```

pub mod actions;
pub mod context;
pub mod error;
pub mod inventory;

pub use actions::AwsActions;
pub use context::AwsContext;
pub use error::{AwsError, classify_aws_error, classify_sdk_error};
pub use inventory::AwsInventory;

use std::sync::Arc;
use warden_core::CloudClientSet;

/// Inventory and actions sharing one loaded configuration
pub fn client_set(ctx: AwsContext) -> CloudClientSet {
    CloudClientSet::new(
        Arc::new(AwsInventory::new(ctx.clone())),
        Arc::new(AwsActions::new(ctx)),
    )
}
