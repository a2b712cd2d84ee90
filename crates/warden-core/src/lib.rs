//! Warden lifecycle engine
//!
//! Proves which cloud resources belong to a logical owner (a cluster, or an
//! ephemeral CI build) and drives only those resources through stop, start
//! or delete, in dependency order, waiting for the cloud to converge.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 LifecycleEngine                  │
//! │  hibernate / resume / teardown / expired sweeps  │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                  warden-core                     │
//! │  ┌──────────────┐  ┌────────────────────────┐   │
//! │  │   TagIndex   │─▶│   OwnershipResolver    │   │
//! │  └──────────────┘  │  ExpirationEvaluator   │   │
//! │                    └───────────┬────────────┘   │
//! │  ┌─────────────────────────────▼────────────┐   │
//! │  │ LifecyclePlanner ─▶ LifecycleDriver      │   │
//! │  │                      └─ ConvergencePoller │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │ trait         │ │ trait         │
//! │ Inventory     │ │ ActionApi     │
//! └───────────────┘ └───────────────┘
//! ```
//!
//! Cloud access goes through [`CloudClientSet`]; see `warden-aws` for the AWS
//! implementation.

pub mod action;
pub mod driver;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod owner;
pub mod ownership;
pub mod planner;
pub mod poller;
pub mod provider;
pub mod report;
pub mod resource;
pub mod tags;

// Re-exports
pub use action::{
    ConvergenceCheck, ConvergenceScope, LifecycleAction, LifecyclePlan, LifecycleStage,
    Operation, PlanSummary, SkippedResource, StageStep, TimeoutPolicy,
};
pub use driver::LifecycleDriver;
pub use engine::{EngineSettings, LifecycleEngine};
pub use error::{Result, WardenError};
pub use expiration::{
    ExpirationEvaluator, ExpirationPolicy, ExpiredResource, days_expired, parse_expiration_date,
};
pub use owner::{ClusterArchitecture, Owner, OwnerKind};
pub use ownership::{Ownership, OwnershipPolicy, OwnershipResolver};
pub use planner::{LifecyclePlanner, PlannerSettings};
pub use poller::{
    ConvergencePoller, ConvergenceTarget, DesiredState, HealthStatus, ObservedState, PollSettings,
};
pub use provider::{ActionApi, CloudClientSet, Inventory, RetryConfig};
pub use report::{JsonReportSink, Outcome, ReportSink, ResourceOutcome, RunReport, RunStatus};
pub use resource::{CloudResource, ResourceType};
pub use tags::TagIndex;
