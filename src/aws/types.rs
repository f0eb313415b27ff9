//! Cloud resource types.
//!
//! Two families of types live here: `*Params` structs carry the desired
//! parameters of a resource as the planner derives them from the descriptor,
//! and `*Info` structs carry what the control plane reports back. Both are
//! provider-neutral so the planner and tests never touch SDK types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::LoadBalancerScheme;

/// Desired cluster parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Cluster name.
    pub name: String,
    /// Container Insights enabled.
    pub container_insights: bool,
}

/// Health check parameters, shared by desired and observed target groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckParams {
    /// HTTP path.
    pub path: String,
    /// Seconds between checks.
    pub interval_secs: u32,
    /// Seconds before a check fails.
    pub timeout_secs: u32,
    /// Successes before healthy.
    pub healthy_threshold: u32,
    /// Failures before unhealthy.
    pub unhealthy_threshold: u32,
    /// Healthy HTTP codes.
    pub matcher: String,
}

/// Desired target group parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupParams {
    /// Target group name.
    pub name: String,
    /// Port traffic is forwarded to (the container port).
    pub port: u16,
    /// VPC of the targets.
    pub vpc_id: String,
    /// Health check settings.
    pub health_check: HealthCheckParams,
}

/// Desired load balancer parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerParams {
    /// Load balancer name.
    pub name: String,
    /// Internet-facing or internal.
    pub scheme: LoadBalancerScheme,
    /// Subnets it is placed in.
    pub subnets: Vec<String>,
    /// Attached security groups.
    pub security_groups: Vec<String>,
}

/// Desired listener parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerParams {
    /// HTTP port the listener accepts traffic on.
    pub port: u16,
}

/// Desired container parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerParams {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Container port.
    pub port: u16,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Command override.
    pub command: Vec<String>,
}

/// Desired task definition parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinitionParams {
    /// Family name.
    pub family: String,
    /// CPU units.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
    /// Execution role ARN.
    pub execution_role_arn: Option<String>,
    /// Task role ARN.
    pub task_role_arn: Option<String>,
    /// The task's container.
    pub container: ContainerParams,
}

/// Desired service parameters.
///
/// The task definition and target group ARNs are bound at apply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    /// Cluster the service runs in.
    pub cluster: String,
    /// Service name.
    pub name: String,
    /// Desired task count.
    pub desired_count: u32,
    /// Task subnets.
    pub subnets: Vec<String>,
    /// Task security groups.
    pub security_groups: Vec<String>,
    /// Whether tasks get public IPs.
    pub assign_public_ip: bool,
    /// Container registered with the target group.
    pub container_name: String,
    /// Port registered with the target group.
    pub container_port: u16,
    /// Load balancer health check grace period.
    pub health_check_grace_period_secs: Option<u32>,
    /// Idempotency token for creation.
    pub client_token: String,
}

/// Observed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name.
    pub name: String,
    /// Cluster ARN.
    pub arn: String,
    /// `ACTIVE`, `PROVISIONING`, `INACTIVE`, ...
    pub status: String,
    /// Services currently in the cluster.
    pub active_services: u32,
    /// Container Insights enabled.
    pub container_insights: bool,
}

/// Observed target group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupInfo {
    /// Target group name.
    pub name: String,
    /// Target group ARN.
    pub arn: String,
    /// Target port.
    pub port: u16,
    /// VPC id.
    pub vpc_id: String,
    /// Health check settings.
    pub health_check: HealthCheckParams,
    /// Load balancers forwarding to this group.
    pub load_balancer_arns: Vec<String>,
}

/// Observed load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerInfo {
    /// Load balancer name.
    pub name: String,
    /// Load balancer ARN.
    pub arn: String,
    /// Public DNS name.
    pub dns_name: String,
    /// Scheme string as reported.
    pub scheme: String,
    /// `provisioning`, `active`, `failed`, ...
    pub state: String,
    /// Subnets, one per availability zone.
    pub subnets: Vec<String>,
    /// Security groups.
    pub security_groups: Vec<String>,
}

/// Observed listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerInfo {
    /// Listener ARN.
    pub arn: String,
    /// Load balancer the listener belongs to.
    pub load_balancer_arn: String,
    /// Listener port.
    pub port: u16,
    /// Target group of the default forward action.
    pub target_group_arn: Option<String>,
}

/// Observed task definition revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinitionInfo {
    /// Revision ARN.
    pub arn: String,
    /// Revision number.
    pub revision: u32,
    /// Parameters read back from the revision.
    pub params: TaskDefinitionParams,
}

/// Rollout state of a service's primary deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    /// Tasks are still being replaced.
    InProgress,
    /// The deployment reached steady state.
    Completed,
    /// The deployment circuit breaker tripped.
    Failed,
}

/// Observed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Service ARN.
    pub arn: String,
    /// Cluster the service runs in.
    pub cluster: String,
    /// `ACTIVE`, `DRAINING` or `INACTIVE`.
    pub status: String,
    /// Desired task count.
    pub desired_count: u32,
    /// Running task count.
    pub running_count: u32,
    /// Pending task count.
    pub pending_count: u32,
    /// Task definition revision ARN in use.
    pub task_definition_arn: String,
    /// Target groups the service registers into.
    pub target_group_arns: Vec<String>,
    /// Task subnets.
    pub subnets: Vec<String>,
    /// Task security groups.
    pub security_groups: Vec<String>,
    /// Whether tasks get public IPs.
    pub assign_public_ip: bool,
    /// Load balancer health check grace period.
    pub health_check_grace_period_secs: Option<u32>,
    /// Rollout state of the primary deployment, if reported.
    pub rollout: Option<RolloutState>,
    /// Number of deployments (more than one while rolling).
    pub deployments: u32,
}

/// Health of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHealth {
    /// Container health checks pass.
    Healthy,
    /// Container health checks fail.
    Unhealthy,
    /// No container health check, or not yet evaluated.
    Unknown,
}

/// Observed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task ARN.
    pub arn: String,
    /// `PROVISIONING`, `PENDING`, `RUNNING`, `STOPPED`, ...
    pub last_status: String,
    /// Container health.
    pub health: TaskHealth,
    /// Task definition revision the task runs.
    pub task_definition_arn: String,
}

/// Load balancer view of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealthInfo {
    /// `initial`, `healthy`, `unhealthy`, `draining`, ...
    pub state: String,
    /// Reason reported for a non-healthy state.
    pub reason: Option<String>,
}

/// How to look a load balancing resource up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// By name.
    Name(&'a str),
    /// By ARN.
    Arn(&'a str),
}

/// Snapshot of the live resources for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Cluster, if active.
    pub cluster: Option<ClusterInfo>,
    /// Target group.
    pub target_group: Option<TargetGroupInfo>,
    /// Load balancer.
    pub load_balancer: Option<LoadBalancerInfo>,
    /// Listener on the configured port.
    pub listener: Option<ListenerInfo>,
    /// Latest active task definition revision of the family.
    pub task_definition: Option<TaskDefinitionInfo>,
    /// Service, if active.
    pub service: Option<ServiceInfo>,
}

/// Identifiers produced by operations and consumed by their dependants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    /// Cluster ARN.
    pub cluster_arn: Option<String>,
    /// Target group ARN.
    pub target_group_arn: Option<String>,
    /// Load balancer ARN.
    pub load_balancer_arn: Option<String>,
    /// Load balancer DNS name.
    pub load_balancer_dns: Option<String>,
    /// Listener ARN.
    pub listener_arn: Option<String>,
    /// Task definition revision ARN.
    pub task_definition_arn: Option<String>,
    /// Service ARN.
    pub service_arn: Option<String>,
}

impl ClusterInfo {
    /// Returns true unless the cluster was deleted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status != "INACTIVE"
    }
}

impl ServiceInfo {
    /// Returns true unless the service was deleted or is being deleted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

impl LoadBalancerInfo {
    /// Returns true once the load balancer accepts traffic.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

impl TargetHealthInfo {
    /// Returns true if the load balancer routes to this target.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == "healthy"
    }
}

impl TaskInfo {
    /// Returns true if the task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.last_status == "RUNNING"
    }
}

impl ObservedState {
    /// Returns true if nothing exists yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cluster.is_none()
            && self.target_group.is_none()
            && self.load_balancer.is_none()
            && self.listener.is_none()
            && self.task_definition.is_none()
            && self.service.is_none()
    }
}

impl Bindings {
    /// Collects the identifiers of resources that already exist.
    #[must_use]
    pub fn from_observed(observed: &ObservedState) -> Self {
        Self {
            cluster_arn: observed.cluster.as_ref().map(|c| c.arn.clone()),
            target_group_arn: observed.target_group.as_ref().map(|t| t.arn.clone()),
            load_balancer_arn: observed.load_balancer.as_ref().map(|l| l.arn.clone()),
            load_balancer_dns: observed.load_balancer.as_ref().map(|l| l.dns_name.clone()),
            listener_arn: observed.listener.as_ref().map(|l| l.arn.clone()),
            task_definition_arn: observed.task_definition.as_ref().map(|t| t.arn.clone()),
            service_arn: observed.service.as_ref().map(|s| s.arn.clone()),
        }
    }

    /// Overwrites these bindings with every identifier `other` carries.
    pub fn merge(&mut self, other: Self) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.cluster_arn, other.cluster_arn);
        take(&mut self.target_group_arn, other.target_group_arn);
        take(&mut self.load_balancer_arn, other.load_balancer_arn);
        take(&mut self.load_balancer_dns, other.load_balancer_dns);
        take(&mut self.listener_arn, other.listener_arn);
        take(&mut self.task_definition_arn, other.task_definition_arn);
        take(&mut self.service_arn, other.service_arn);
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl fmt::Display for TaskHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
