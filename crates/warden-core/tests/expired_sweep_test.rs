mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::{FakeCloud, REGION, ci_vpc, full_vpc};
use serde_json::json;
use std::sync::Arc;
use tokio_test::assert_ok;
use warden_core::resource::attr;
use warden_core::tags::{TAG_BUILD_ID, TAG_EXPIRATION_DATE, TAG_JOB};
use warden_core::{
    CloudResource, EngineSettings, ExpirationEvaluator, ExpirationPolicy, LifecycleAction,
    LifecycleEngine, Operation, ResourceType,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

fn live_engine(cloud: &Arc<FakeCloud>) -> LifecycleEngine {
    LifecycleEngine::new(
        cloud.clients(),
        EngineSettings {
            dry_run: false,
            ..Default::default()
        },
    )
}

fn vpc_expiring(id: &str, build_id: &str, expiration: &str) -> Vec<CloudResource> {
    let mut resources = full_vpc(id, build_id);
    resources[0] = ci_vpc(id, build_id, expiration);
    resources
}

fn ci_tagged(id: &str, ty: ResourceType, region: &str, expiration: &str) -> CloudResource {
    CloudResource::new(id, ty, region)
        .with_tag(TAG_EXPIRATION_DATE, expiration)
        .with_tag(TAG_JOB, "pull-ci-e2e-aws")
}

#[test]
fn test_vpc_expiration_scenario() {
    let evaluator = ExpirationEvaluator::new(ExpirationPolicy::for_vpcs().with_grace_days(2));
    let vpc = ci_vpc("vpc-1", "1001", "2025-01-01T00:00+00:00");
    let now = Utc.with_ymd_and_hms(2025, 1, 3, 0, 1, 0).unwrap();

    let expired = evaluator.evaluate(&vpc, now).unwrap().unwrap();
    assert_eq!(expired.days_expired, 2);
}

#[test]
fn test_missing_required_tag_never_expires_for_any_grace() {
    let vpc = CloudResource::new("vpc-1", ResourceType::Vpc, REGION)
        .with_tag(TAG_EXPIRATION_DATE, "2020-01-01T00:00Z");

    for grace in [0, 1, 2, 30] {
        let evaluator = ExpirationEvaluator::new(ExpirationPolicy::for_vpcs().with_grace_days(grace));
        assert!(!evaluator.is_expired(&vpc, now()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_expired_vpcs_are_torn_down_oldest_first() {
    let mut resources = vpc_expiring("vpc-new", "1002", "2024-01-10T00:00Z");
    resources.extend(vpc_expiring("vpc-old", "1001", "2024-01-01T00:00Z"));
    resources.extend(vpc_expiring("vpc-fresh", "1003", "2024-01-31T00:00Z"));
    resources.push(
        CloudResource::new("vpc-shared", ResourceType::Vpc, REGION)
            .with_tag(TAG_EXPIRATION_DATE, "2023-01-01T00:00Z"),
    );
    let cloud = FakeCloud::new(resources);
    let engine = live_engine(&cloud);

    let reports = assert_ok!(engine.teardown_expired_vpcs(REGION, now()).await);

    let targets: Vec<&str> = reports.iter().map(|r| r.target_id.as_str()).collect();
    assert_eq!(targets, vec!["vpc-old", "vpc-new"]);
    assert!(reports.iter().all(|r| r.is_success()));
    assert!(!cloud.exists("vpc-old"));
    assert!(!cloud.exists("subnet-vpc-new"));
    assert!(cloud.exists("vpc-fresh"));
    assert!(cloud.exists("subnet-vpc-fresh"));
    assert!(cloud.exists("vpc-shared"));

    let vpc_deletes: Vec<String> = cloud
        .calls_for(LifecycleAction::Delete, ResourceType::Vpc)
        .into_iter()
        .flat_map(|c| c.ids)
        .collect();
    assert_eq!(vpc_deletes, vec!["vpc-old", "vpc-new"]);
}

#[tokio::test(start_paused = true)]
async fn test_global_sweep_deletes_expired_leftovers() {
    let cloud = FakeCloud::new(vec![
        ci_tagged("ci-op-role", ResourceType::IamRole, "", "2024-01-05T00:00Z"),
        ci_tagged("ci-op-profile", ResourceType::InstanceProfile, "", "2024-01-31T00:00Z"),
        CloudResource::new("untagged-role", ResourceType::IamRole, "")
            .with_tag(TAG_EXPIRATION_DATE, "2020-01-01T00:00Z"),
        CloudResource::new("oidc.example/ci-1001", ResourceType::OidcProvider, "")
            .with_tag(TAG_EXPIRATION_DATE, "2024-01-02T00:00Z")
            .with_tag(TAG_BUILD_ID, "1001"),
        ci_tagged("eipalloc-1", ResourceType::ElasticIp, REGION, "2024-01-01T00:00Z")
            .with_attribute(attr::ASSOCIATION_ID, json!("eipassoc-1")),
        ci_tagged("eipalloc-2", ResourceType::ElasticIp, "eu-west-1", "2024-01-01T00:00Z"),
    ]);
    let engine = live_engine(&cloud);

    let report = assert_ok!(engine.sweep_expired_global(REGION, now()).await);

    assert_eq!(report.operation, Operation::ExpiredSweep);
    assert!(report.is_success());
    let order: Vec<(LifecycleAction, String)> = cloud
        .calls()
        .into_iter()
        .map(|c| (c.action, c.ids[0].clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            (LifecycleAction::Detach, "eipalloc-1".to_string()),
            (LifecycleAction::Release, "eipalloc-1".to_string()),
            (LifecycleAction::Delete, "oidc.example/ci-1001".to_string()),
            (LifecycleAction::Delete, "ci-op-role".to_string()),
        ]
    );
    assert!(cloud.exists("ci-op-profile"));
    assert!(cloud.exists("untagged-role"));
    assert!(cloud.exists("eipalloc-2"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_vpc_expiration_is_never_torn_down() {
    let cloud = FakeCloud::new(vpc_expiring("vpc-bad", "1001", "not-a-date"));
    let engine = live_engine(&cloud);

    let reports = assert_ok!(engine.teardown_expired_vpcs(REGION, now()).await);

    assert!(reports.is_empty());
    assert!(cloud.calls().is_empty());
    assert!(cloud.exists("vpc-bad"));
    assert!(cloud.exists("subnet-vpc-bad"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_vpc_expiration_does_not_block_others() {
    let mut resources = vpc_expiring("vpc-bad", "1001", "2024-13-45");
    resources.extend(vpc_expiring("vpc-old", "1002", "2024-01-01T00:00Z"));
    let cloud = FakeCloud::new(resources);
    let engine = live_engine(&cloud);

    let reports = assert_ok!(engine.teardown_expired_vpcs(REGION, now()).await);

    let targets: Vec<&str> = reports.iter().map(|r| r.target_id.as_str()).collect();
    assert_eq!(targets, vec!["vpc-old"]);
    assert!(cloud.calls().iter().all(|c| c.ids.iter().all(|id| !id.ends_with("vpc-bad"))));
    assert!(cloud.exists("vpc-bad"));
    assert!(!cloud.exists("vpc-old"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_global_expiration_is_never_swept() {
    let cloud = FakeCloud::new(vec![
        ci_tagged("ci-op-role", ResourceType::IamRole, "", "yesterday"),
        ci_tagged("ci-op-profile", ResourceType::InstanceProfile, "", ""),
        ci_tagged("eipalloc-1", ResourceType::ElasticIp, REGION, "next week"),
        CloudResource::new("oidc.example/ci-1001", ResourceType::OidcProvider, "")
            .with_tag(TAG_EXPIRATION_DATE, "01/01/2024")
            .with_tag(TAG_BUILD_ID, "1001"),
    ]);
    let engine = live_engine(&cloud);

    let report = assert_ok!(engine.sweep_expired_global(REGION, now()).await);

    assert!(report.is_success());
    assert!(cloud.calls().is_empty());
    assert!(cloud.exists("ci-op-role"));
    assert!(cloud.exists("oidc.example/ci-1001"));
}
