//! In-memory [`CloudApi`] for tests.
//!
//! Keeps resources in maps behind a mutex, records every call, and can be
//! told to fail named operations transiently or permanently.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::config::{DeploymentSpec, SpecLoader};
use crate::error::{CloudError, Result};
use crate::planner::DesiredState;

use super::api::CloudApi;
use super::types::{
    ClusterInfo, ClusterParams, ListenerInfo, LoadBalancerInfo, LoadBalancerParams, Lookup,
    RolloutState, ServiceInfo, ServiceParams, TargetGroupInfo, TargetGroupParams,
    TargetHealthInfo, TaskDefinitionInfo, TaskDefinitionParams, TaskHealth, TaskInfo,
};

const ACCOUNT: &str = "arn:aws:ecs:us-east-1:123456789012";
const ELB_ACCOUNT: &str = "arn:aws:elasticloadbalancing:us-east-1:123456789012";

/// A valid descriptor used across tests.
pub fn test_spec() -> DeploymentSpec {
    SpecLoader::parse_yaml(
        r"
cluster:
  name: lamp-cluster
service:
  name: lamp
  desired_count: 2
task:
  execution_role_arn: arn:aws:iam::123456789012:role/ecsTaskExecutionRole
  container:
    image: 123456789012.dkr.ecr.us-east-1.amazonaws.com/lamp:1.0
    port: 80
network:
  vpc_id: vpc-0abc1234
  subnets: [subnet-0aaa1111, subnet-0bbb2222]
  security_groups: [sg-0123abcd]
rollout:
  max_concurrency: 1
  retry:
    max_attempts: 3
    base_delay_ms: 100
    max_delay_ms: 1000
  convergence:
    interval_secs: 5
    timeout_secs: 60
",
        None,
    )
    .expect("test spec parses")
}

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy)]
enum Failure {
    /// Throttle the next `n` calls.
    Transient(u32),
    /// Throttle every call.
    AlwaysTransient,
    /// Deny every call.
    Permanent,
}

#[derive(Debug, Default)]
struct FakeState {
    clusters: BTreeMap<String, ClusterInfo>,
    target_groups: BTreeMap<String, TargetGroupInfo>,
    load_balancers: BTreeMap<String, LoadBalancerInfo>,
    listeners: Vec<ListenerInfo>,
    task_definitions: Vec<(TaskDefinitionInfo, bool)>,
    services: BTreeMap<(String, String), ServiceInfo>,
    failures: HashMap<String, Failure>,
    attempts: HashMap<String, u32>,
    calls: Vec<String>,
    running_script: VecDeque<u32>,
    rollout: Option<RolloutState>,
    next_id: u64,
}

/// In-memory control plane.
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    /// Creates an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates every resource of `spec` directly, then clears the call log.
    pub async fn provision(&self, spec: &DeploymentSpec) {
        let desired = DesiredState::from_spec(spec, "token").expect("desired state");
        self.create_cluster(&desired.cluster).await.expect("cluster");
        let tg = self.create_target_group(&desired.target_group).await.expect("tg");
        let lb = self.create_load_balancer(&desired.load_balancer).await.expect("lb");
        self.create_listener(&lb.arn, desired.listener.port, &tg.arn)
            .await
            .expect("listener");
        let td = self
            .register_task_definition(&desired.task_definition)
            .await
            .expect("td");
        self.create_service(&desired.service, &td.arn, &tg.arn)
            .await
            .expect("service");
        self.clear_calls();
    }

    /// Throttles the next `times` calls of `operation`.
    pub fn fail_transient(&self, operation: &str, times: u32) {
        self.lock().failures.insert(operation.to_string(), Failure::Transient(times));
    }

    /// Throttles every call of `operation`.
    pub fn fail_always(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string(), Failure::AlwaysTransient);
    }

    /// Denies every call of `operation`.
    pub fn fail_permanent(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string(), Failure::Permanent);
    }

    /// Number of attempts made for `operation`, failed or not.
    pub fn attempts(&self, operation: &str) -> u32 {
        self.lock().attempts.get(operation).copied().unwrap_or_default()
    }

    /// Successful mutating calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Clears the call and attempt logs.
    pub fn clear_calls(&self) {
        let mut state = self.lock();
        state.calls.clear();
        state.attempts.clear();
    }

    /// Running counts reported by successive service describes.
    ///
    /// The last value sticks once the script runs out.
    pub fn script_running(&self, counts: &[u32]) {
        self.lock().running_script = counts.iter().copied().collect();
    }

    /// Forces the rollout state reported for every service.
    pub fn set_rollout(&self, rollout: RolloutState) {
        self.lock().rollout = Some(rollout);
    }

    /// Overrides a cluster's status.
    pub fn set_cluster_status(&self, name: &str, status: &str) {
        if let Some(cluster) = self.lock().clusters.get_mut(name) {
            cluster.status = status.to_string();
        }
    }

    /// Adds a foreign service to a cluster's count.
    pub fn add_foreign_service(&self, cluster: &str) {
        if let Some(cluster) = self.lock().clusters.get_mut(cluster) {
            cluster.active_services += 1;
        }
    }

    /// Number of registered revisions still active for `family`.
    pub fn active_revisions(&self, family: &str) -> usize {
        self.lock()
            .task_definitions
            .iter()
            .filter(|(td, active)| *active && td.params.family == family)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    /// Records an attempt and applies any injected failure.
    fn enter(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.lock();
        *state.attempts.entry(operation.to_string()).or_default() += 1;

        match state.failures.get(operation).copied() {
            Some(Failure::Transient(n)) if n > 0 => {
                state.failures.insert(operation.to_string(), Failure::Transient(n - 1));
                Err(CloudError::throttled(operation, "Rate exceeded").into())
            }
            Some(Failure::AlwaysTransient) => {
                Err(CloudError::throttled(operation, "Rate exceeded").into())
            }
            Some(Failure::Permanent) => {
                Err(CloudError::access_denied(operation, "not authorized").into())
            }
            _ => Ok(state),
        }
    }
}

impl FakeState {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }

    fn refresh_service(&mut self, key: &(String, String)) -> Option<ServiceInfo> {
        let next = self.running_script.pop_front();
        if self.running_script.is_empty()
            && let Some(last) = next
        {
            self.running_script.push_back(last);
        }
        let rollout = self.rollout;

        let service = self.services.get_mut(key)?;
        if let Some(running) = next {
            service.running_count = running;
        }
        if let Some(rollout) = rollout {
            service.rollout = Some(rollout);
        }
        Some(service.clone())
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterInfo>> {
        let state = self.enter("DescribeClusters")?;
        Ok(state.clusters.get(name).cloned())
    }

    async fn create_cluster(&self, params: &ClusterParams) -> Result<ClusterInfo> {
        let mut state = self.enter("CreateCluster")?;
        state.record(format!("CreateCluster {}", params.name));

        let cluster = ClusterInfo {
            name: params.name.clone(),
            arn: format!("{ACCOUNT}:cluster/{}", params.name),
            status: String::from("ACTIVE"),
            active_services: 0,
            container_insights: params.container_insights,
        };
        Ok(state
            .clusters
            .entry(params.name.clone())
            .or_insert(cluster)
            .clone())
    }

    async fn update_cluster(&self, params: &ClusterParams) -> Result<ClusterInfo> {
        let mut state = self.enter("UpdateClusterSettings")?;
        state.record(format!("UpdateClusterSettings {}", params.name));

        let cluster = state
            .clusters
            .get_mut(&params.name)
            .ok_or_else(|| CloudError::not_found("UpdateClusterSettings", &params.name))?;
        cluster.container_insights = params.container_insights;
        Ok(cluster.clone())
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        let mut state = self.enter("DeleteCluster")?;
        state.record(format!("DeleteCluster {name}"));
        state.clusters.remove(name);
        Ok(())
    }

    async fn describe_target_group(&self, lookup: Lookup<'_>) -> Result<Option<TargetGroupInfo>> {
        let state = self.enter("DescribeTargetGroups")?;
        Ok(match lookup {
            Lookup::Name(name) => state.target_groups.get(name).cloned(),
            Lookup::Arn(arn) => state.target_groups.values().find(|t| t.arn == arn).cloned(),
        })
    }

    async fn create_target_group(&self, params: &TargetGroupParams) -> Result<TargetGroupInfo> {
        let mut state = self.enter("CreateTargetGroup")?;
        state.record(format!("CreateTargetGroup {}", params.name));

        let id = state.id();
        let group = TargetGroupInfo {
            name: params.name.clone(),
            arn: format!("{ELB_ACCOUNT}:targetgroup/{}/{id:016x}", params.name),
            port: params.port,
            vpc_id: params.vpc_id.clone(),
            health_check: params.health_check.clone(),
            load_balancer_arns: Vec::new(),
        };
        Ok(state
            .target_groups
            .entry(params.name.clone())
            .or_insert(group)
            .clone())
    }

    async fn modify_target_group(
        &self,
        arn: &str,
        params: &TargetGroupParams,
    ) -> Result<TargetGroupInfo> {
        let mut state = self.enter("ModifyTargetGroup")?;
        state.record(format!("ModifyTargetGroup {}", params.name));

        let group = state
            .target_groups
            .values_mut()
            .find(|t| t.arn == arn)
            .ok_or_else(|| CloudError::not_found("ModifyTargetGroup", arn))?;
        group.health_check = params.health_check.clone();
        Ok(group.clone())
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        let mut state = self.enter("DeleteTargetGroup")?;
        state.record("DeleteTargetGroup");
        state.target_groups.retain(|_, t| t.arn != arn);
        Ok(())
    }

    async fn describe_target_health(&self, arn: &str) -> Result<Vec<TargetHealthInfo>> {
        let state = self.enter("DescribeTargetHealth")?;
        let running = state
            .services
            .values()
            .filter(|s| s.target_group_arns.iter().any(|t| t == arn))
            .map(|s| s.running_count)
            .sum::<u32>();

        Ok((0..running)
            .map(|_| TargetHealthInfo {
                state: String::from("healthy"),
                reason: None,
            })
            .collect())
    }

    async fn describe_load_balancer(&self, lookup: Lookup<'_>) -> Result<Option<LoadBalancerInfo>> {
        let state = self.enter("DescribeLoadBalancers")?;
        Ok(match lookup {
            Lookup::Name(name) => state.load_balancers.get(name).cloned(),
            Lookup::Arn(arn) => state.load_balancers.values().find(|l| l.arn == arn).cloned(),
        })
    }

    async fn create_load_balancer(&self, params: &LoadBalancerParams) -> Result<LoadBalancerInfo> {
        let mut state = self.enter("CreateLoadBalancer")?;
        state.record(format!("CreateLoadBalancer {}", params.name));

        let id = state.id();
        let lb = LoadBalancerInfo {
            name: params.name.clone(),
            arn: format!("{ELB_ACCOUNT}:loadbalancer/app/{}/{id:016x}", params.name),
            dns_name: format!("{}-{id}.us-east-1.elb.amazonaws.com", params.name),
            scheme: params.scheme.as_str().to_string(),
            state: String::from("active"),
            subnets: params.subnets.clone(),
            security_groups: params.security_groups.clone(),
        };
        Ok(state
            .load_balancers
            .entry(params.name.clone())
            .or_insert(lb)
            .clone())
    }

    async fn update_load_balancer(
        &self,
        arn: &str,
        params: &LoadBalancerParams,
    ) -> Result<LoadBalancerInfo> {
        let mut state = self.enter("SetSubnets")?;
        state.record(format!("SetSubnets {}", params.name));

        let lb = state
            .load_balancers
            .values_mut()
            .find(|l| l.arn == arn)
            .ok_or_else(|| CloudError::not_found("SetSubnets", arn))?;
        lb.subnets.clone_from(&params.subnets);
        lb.security_groups.clone_from(&params.security_groups);
        Ok(lb.clone())
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        let mut state = self.enter("DeleteLoadBalancer")?;
        state.record("DeleteLoadBalancer");
        state.load_balancers.retain(|_, l| l.arn != arn);
        state.listeners.retain(|l| l.load_balancer_arn != arn);
        for group in state.target_groups.values_mut() {
            group.load_balancer_arns.retain(|a| a != arn);
        }
        Ok(())
    }

    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<ListenerInfo>> {
        let state = self.enter("DescribeListeners")?;
        Ok(state
            .listeners
            .iter()
            .filter(|l| l.load_balancer_arn == load_balancer_arn)
            .cloned()
            .collect())
    }

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        port: u16,
        target_group_arn: &str,
    ) -> Result<ListenerInfo> {
        let mut state = self.enter("CreateListener")?;

        if !state.load_balancers.values().any(|l| l.arn == load_balancer_arn) {
            return Err(CloudError::not_found("CreateListener", load_balancer_arn).into());
        }
        state.record(format!("CreateListener {port}"));

        let id = state.id();
        let listener = ListenerInfo {
            arn: format!("{ELB_ACCOUNT}:listener/app/{id:016x}"),
            load_balancer_arn: load_balancer_arn.to_string(),
            port,
            target_group_arn: Some(target_group_arn.to_string()),
        };
        state.listeners.push(listener.clone());

        if let Some(group) = state.target_groups.values_mut().find(|t| t.arn == target_group_arn)
            && !group.load_balancer_arns.iter().any(|a| a == load_balancer_arn)
        {
            group.load_balancer_arns.push(load_balancer_arn.to_string());
        }

        Ok(listener)
    }

    async fn update_listener(&self, listener_arn: &str, target_group_arn: &str) -> Result<ListenerInfo> {
        let mut state = self.enter("ModifyListener")?;
        state.record("ModifyListener");

        let listener = state
            .listeners
            .iter_mut()
            .find(|l| l.arn == listener_arn)
            .ok_or_else(|| CloudError::not_found("ModifyListener", listener_arn))?;
        listener.target_group_arn = Some(target_group_arn.to_string());
        Ok(listener.clone())
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        let mut state = self.enter("DeleteListener")?;
        state.record("DeleteListener");
        state.listeners.retain(|l| l.arn != arn);
        Ok(())
    }

    async fn describe_task_definition(&self, family_or_arn: &str) -> Result<Option<TaskDefinitionInfo>> {
        let state = self.enter("DescribeTaskDefinition")?;
        Ok(state
            .task_definitions
            .iter()
            .rev()
            .filter(|(_, active)| *active)
            .map(|(td, _)| td)
            .find(|td| td.arn == family_or_arn || td.params.family == family_or_arn)
            .cloned())
    }

    async fn register_task_definition(
        &self,
        params: &TaskDefinitionParams,
    ) -> Result<TaskDefinitionInfo> {
        let mut state = self.enter("RegisterTaskDefinition")?;
        state.record(format!("RegisterTaskDefinition {}", params.family));

        let revision = state
            .task_definitions
            .iter()
            .filter(|(td, _)| td.params.family == params.family)
            .count()
            + 1;
        let revision = u32::try_from(revision).expect("revision fits");
        let td = TaskDefinitionInfo {
            arn: format!("{ACCOUNT}:task-definition/{}:{revision}", params.family),
            revision,
            params: params.clone(),
        };
        state.task_definitions.push((td.clone(), true));
        Ok(td)
    }

    async fn deregister_task_definition(&self, arn: &str) -> Result<()> {
        let mut state = self.enter("DeregisterTaskDefinition")?;
        state.record("DeregisterTaskDefinition");
        for (td, active) in &mut state.task_definitions {
            if td.arn == arn {
                *active = false;
            }
        }
        Ok(())
    }

    async fn describe_service(&self, cluster: &str, service: &str) -> Result<Option<ServiceInfo>> {
        let mut state = self.enter("DescribeServices")?;
        Ok(state.refresh_service(&(cluster.to_string(), service.to_string())))
    }

    async fn create_service(
        &self,
        params: &ServiceParams,
        task_definition_arn: &str,
        target_group_arn: &str,
    ) -> Result<ServiceInfo> {
        let mut state = self.enter("CreateService")?;

        if !state.clusters.contains_key(&params.cluster) {
            return Err(CloudError::not_found("CreateService", &params.cluster).into());
        }
        state.record(format!("CreateService {}", params.name));

        let key = (params.cluster.clone(), params.name.clone());
        if let Some(existing) = state.services.get(&key) {
            return Ok(existing.clone());
        }

        let service = ServiceInfo {
            name: params.name.clone(),
            arn: format!("{ACCOUNT}:service/{}/{}", params.cluster, params.name),
            cluster: params.cluster.clone(),
            status: String::from("ACTIVE"),
            desired_count: params.desired_count,
            running_count: params.desired_count,
            pending_count: 0,
            task_definition_arn: task_definition_arn.to_string(),
            target_group_arns: vec![target_group_arn.to_string()],
            subnets: params.subnets.clone(),
            security_groups: params.security_groups.clone(),
            assign_public_ip: params.assign_public_ip,
            health_check_grace_period_secs: params.health_check_grace_period_secs,
            rollout: Some(RolloutState::Completed),
            deployments: 1,
        };
        state.services.insert(key, service.clone());
        if let Some(cluster) = state.clusters.get_mut(&params.cluster) {
            cluster.active_services += 1;
        }
        Ok(service)
    }

    async fn update_service(&self, params: &ServiceParams, task_definition_arn: &str) -> Result<ServiceInfo> {
        let mut state = self.enter("UpdateService")?;
        state.record(format!("UpdateService {}", params.name));

        let key = (params.cluster.clone(), params.name.clone());
        let service = state
            .services
            .get_mut(&key)
            .ok_or_else(|| CloudError::not_found("UpdateService", &params.name))?;
        service.task_definition_arn = task_definition_arn.to_string();
        service.desired_count = params.desired_count;
        service.running_count = params.desired_count;
        service.subnets.clone_from(&params.subnets);
        service.security_groups.clone_from(&params.security_groups);
        service.assign_public_ip = params.assign_public_ip;
        service.health_check_grace_period_secs = params.health_check_grace_period_secs;
        Ok(service.clone())
    }

    async fn delete_service(&self, cluster: &str, service: &str) -> Result<()> {
        let mut state = self.enter("DeleteService")?;
        state.record(format!("DeleteService {service}"));

        if state.services.remove(&(cluster.to_string(), service.to_string())).is_some()
            && let Some(info) = state.clusters.get_mut(cluster)
        {
            info.active_services = info.active_services.saturating_sub(1);
        }
        Ok(())
    }

    async fn describe_service_tasks(&self, cluster: &str, service: &str) -> Result<Vec<TaskInfo>> {
        let state = self.enter("ListTasks")?;
        let Some(info) = state.services.get(&(cluster.to_string(), service.to_string())) else {
            return Ok(Vec::new());
        };

        Ok((0..info.running_count)
            .map(|i| TaskInfo {
                arn: format!("{ACCOUNT}:task/{cluster}/{i:032x}"),
                last_status: String::from("RUNNING"),
                health: TaskHealth::Healthy,
                task_definition_arn: info.task_definition_arn.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_failure_clears() {
        let fake = FakeCloud::new();
        fake.fail_transient("DescribeClusters", 2);

        assert!(fake.describe_cluster("x").await.is_err());
        assert!(fake.describe_cluster("x").await.is_err());
        assert!(fake.describe_cluster("x").await.is_ok());
        assert_eq!(fake.attempts("DescribeClusters"), 3);
    }

    #[tokio::test]
    async fn test_running_script() {
        let fake = FakeCloud::new();
        fake.provision(&test_spec()).await;
        fake.script_running(&[0, 1]);

        let counts: Vec<u32> = [
            fake.describe_service("lamp-cluster", "lamp").await,
            fake.describe_service("lamp-cluster", "lamp").await,
            fake.describe_service("lamp-cluster", "lamp").await,
        ]
        .into_iter()
        .map(|s| s.unwrap().unwrap().running_count)
        .collect();

        assert_eq!(counts, vec![0, 1, 1]);
    }
}
