use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use warden_core::resource::attr;
use warden_core::tags::{TAG_BUILD_ID, TAG_EXPIRATION_DATE, TAG_HCP_CLUSTER_NAME, TAG_NAME};
use warden_core::{
    ActionApi, CloudClientSet, CloudResource, HealthStatus, Inventory, LifecycleAction,
    ObservedState, ResourceType, Result, WardenError,
};

pub const REGION: &str = "us-west-2";

/// How a scripted action call should fail
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Failure {
    NotFound,
    /// Busy for this many calls, then succeeds
    Busy(u32),
    Reject(String),
}

/// One mutating call as the fake received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub action: LifecycleAction,
    pub resource_type: ResourceType,
    pub ids: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    resources: Vec<CloudResource>,
    health: HashMap<String, HealthStatus>,
    calls: Vec<Call>,
    failures: HashMap<(LifecycleAction, String), Failure>,
    stuck: HashSet<String>,
    replace_on_terminate: bool,
    observe_calls: u32,
}

/// In-memory account: inventory and action API over the same resources
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

#[allow(dead_code)]
impl FakeCloud {
    pub fn new(resources: Vec<CloudResource>) -> Arc<Self> {
        let cloud = Self::default();
        cloud.state.lock().unwrap().resources = resources;
        Arc::new(cloud)
    }

    pub fn clients(self: &Arc<Self>) -> CloudClientSet {
        CloudClientSet::new(self.clone(), self.clone())
    }

    pub fn fail(&self, action: LifecycleAction, id: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((action, id.to_string()), failure);
    }

    /// State changes on this resource are accepted but never happen
    pub fn stick(&self, id: &str) {
        self.state.lock().unwrap().stuck.insert(id.to_string());
    }

    /// Terminated instances come back under a new id, like a node pool
    pub fn replace_on_terminate(&self) {
        self.state.lock().unwrap().replace_on_terminate = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, action: LifecycleAction, resource_type: ResourceType) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.action == action && c.resource_type == resource_type)
            .collect()
    }

    pub fn observe_calls(&self) -> u32 {
        self.state.lock().unwrap().observe_calls
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .resources
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.state.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state_of(id).is_some()
    }
}

fn apply(state: &mut FakeState, action: LifecycleAction, resource: &CloudResource) {
    if state.stuck.contains(&resource.id) {
        return;
    }
    let replace = state.replace_on_terminate;
    let Some(pos) = state.resources.iter().position(|r| r.id == resource.id) else {
        return;
    };

    match action {
        LifecycleAction::Stop => {
            state.resources[pos].state = "stopped".to_string();
            state.health.remove(&resource.id);
        }
        LifecycleAction::Start => {
            state.resources[pos].state = "running".to_string();
            state
                .health
                .insert(resource.id.clone(), HealthStatus::new("ok", "ok"));
        }
        LifecycleAction::Terminate => {
            state.resources[pos].state = "terminated".to_string();
            if replace {
                let replacement = CloudResource {
                    id: format!("{}-r", resource.id),
                    state: "running".to_string(),
                    ..state.resources[pos].clone()
                };
                state
                    .health
                    .insert(replacement.id.clone(), HealthStatus::new("ok", "ok"));
                state.resources.push(replacement);
            }
        }
        LifecycleAction::Delete | LifecycleAction::Release => {
            if resource.resource_type == ResourceType::NatGateway {
                state.resources[pos].state = "deleted".to_string();
            } else {
                state.resources.remove(pos);
            }
        }
        LifecycleAction::Detach => {
            state.resources[pos].attributes.remove(attr::ASSOCIATION_ID);
            state.resources[pos].attributes.remove(attr::ATTACHED_INSTANCE);
        }
        LifecycleAction::RevokeRules => {}
    }
}

#[async_trait]
impl Inventory for FakeCloud {
    async fn list_resources(
        &self,
        resource_type: ResourceType,
        region: &str,
        state_filter: Option<&str>,
    ) -> Result<Vec<CloudResource>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .filter(|r| resource_type.is_global() || r.region == region)
            .filter(|r| state_filter.is_none_or(|s| r.state == s))
            .cloned()
            .collect())
    }

    async fn observe(
        &self,
        resource_type: ResourceType,
        _region: &str,
        ids: &[String],
    ) -> Result<Vec<ObservedState>> {
        let mut state = self.state.lock().unwrap();
        state.observe_calls += 1;
        Ok(state
            .resources
            .iter()
            .filter(|r| r.resource_type == resource_type && ids.contains(&r.id))
            .map(|r| ObservedState {
                id: r.id.clone(),
                state: r.state.clone(),
                health: state.health.get(&r.id).cloned(),
            })
            .collect())
    }
}

#[async_trait]
impl ActionApi for FakeCloud {
    fn name(&self) -> &str {
        "fake"
    }

    async fn perform(&self, action: LifecycleAction, resources: &[CloudResource]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<String> = resources.iter().map(|r| r.id.clone()).collect();
        state.calls.push(Call {
            action,
            resource_type: resources[0].resource_type,
            ids: ids.clone(),
        });

        for id in &ids {
            let key = (action, id.clone());
            match state.failures.get(&key).cloned() {
                Some(Failure::NotFound) => {
                    return Err(WardenError::ResourceNotFound(id.clone()));
                }
                Some(Failure::Reject(message)) => {
                    return Err(WardenError::ActionFailed(message));
                }
                Some(Failure::Busy(remaining)) if remaining > 0 => {
                    state.failures.insert(key, Failure::Busy(remaining - 1));
                    return Err(WardenError::ResourceBusy(id.clone()));
                }
                _ => {}
            }
        }

        for r in resources {
            apply(&mut state, action, r);
        }
        Ok(())
    }
}

// Fixtures

#[allow(dead_code)]
pub fn in_vpc(id: &str, ty: ResourceType, vpc: &str, build_id: &str) -> CloudResource {
    CloudResource::new(id, ty, REGION)
        .with_parent_vpc(vpc)
        .with_tag(TAG_BUILD_ID, build_id)
}

#[allow(dead_code)]
pub fn ci_vpc(id: &str, build_id: &str, expiration: &str) -> CloudResource {
    CloudResource::new(id, ResourceType::Vpc, REGION)
        .with_state("available")
        .with_tag(TAG_BUILD_ID, build_id)
        .with_tag(TAG_EXPIRATION_DATE, expiration)
}

/// One VPC with a resource of every teardown type, all tagged with `build_id`
#[allow(dead_code)]
pub fn full_vpc(vpc: &str, build_id: &str) -> Vec<CloudResource> {
    let child = |suffix: &str, ty: ResourceType| {
        in_vpc(&format!("{suffix}-{vpc}"), ty, vpc, build_id)
    };
    vec![
        ci_vpc(vpc, build_id, "2024-01-01T00:00Z"),
        child("nat", ResourceType::NatGateway).with_state("available"),
        child("i", ResourceType::Instance).with_state("running"),
        child("elb", ResourceType::ClassicLoadBalancer),
        child("alb", ResourceType::LoadBalancer).with_state("active"),
        child("eni", ResourceType::NetworkInterface).with_state("available"),
        child("sg", ResourceType::SecurityGroup)
            .with_attribute(attr::GROUP_NAME, json!("ci-workers")),
        child("subnet", ResourceType::Subnet).with_state("available"),
        child("rtb", ResourceType::RouteTable).with_attribute(attr::IS_MAIN, json!(false)),
        child("eipalloc", ResourceType::ElasticIp)
            .with_attribute(attr::ASSOCIATION_ID, json!(format!("eipassoc-{vpc}"))),
        child("igw", ResourceType::InternetGateway).with_state("attached"),
        child("vpce", ResourceType::VpcEndpoint).with_state("available"),
    ]
}

#[allow(dead_code)]
pub fn hcp_worker(id: &str, cluster: &str, state: &str) -> CloudResource {
    CloudResource::new(id, ResourceType::Instance, REGION)
        .with_state(state)
        .with_tag(TAG_HCP_CLUSTER_NAME, cluster)
        .with_tag(TAG_NAME, format!("{cluster}-workers-{id}"))
}

#[allow(dead_code)]
pub fn root_volume(id: &str, instance: &str) -> CloudResource {
    CloudResource::new(id, ResourceType::Volume, REGION)
        .with_state("in-use")
        .with_attribute(attr::ATTACHED_INSTANCE, json!(instance))
        .with_attribute(attr::DELETE_ON_TERMINATION, json!(true))
}
