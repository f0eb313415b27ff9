//! Deployment descriptor types.
//!
//! This module defines the structs that map to the `ecs-deploy.yaml` file.
//! Together they fully describe the desired state of one ECS service and the
//! cluster, task definition and load balancer wiring it needs.
//!
//! Required fields deserialize to empty defaults when omitted so that the
//! validator, not the parser, reports them by field name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

/// The root structure of a deployment descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct DeploymentSpec {
    /// AWS region. Falls back to the SDK default chain when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// ECS cluster.
    #[serde(default)]
    #[validate(nested)]
    pub cluster: ClusterSpec,
    /// ECS service.
    #[serde(default)]
    #[validate(nested)]
    pub service: ServiceSpec,
    /// Task definition.
    #[serde(default)]
    #[validate(nested)]
    pub task: TaskSpec,
    /// VPC networking.
    #[serde(default)]
    #[validate(nested)]
    pub network: NetworkSpec,
    /// Application load balancer.
    #[serde(default)]
    #[validate(nested)]
    pub load_balancer: LoadBalancerSpec,
    /// Target group the service registers into.
    #[serde(default)]
    #[validate(nested)]
    pub target_group: TargetGroupSpec,
    /// Retry, concurrency and convergence settings.
    #[serde(default)]
    #[validate(nested)]
    pub rollout: RolloutSpec,
    /// Where run state and the run lock are kept.
    #[serde(default)]
    pub state: StateSpec,
}

/// ECS cluster settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ClusterSpec {
    /// Cluster name.
    #[serde(default)]
    #[validate(length(min = 1, message = "cluster name is required"))]
    pub name: String,
    /// Enable `CloudWatch` Container Insights.
    #[serde(default)]
    pub container_insights: bool,
}

/// ECS service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ServiceSpec {
    /// Service name.
    #[serde(default)]
    #[validate(length(min = 1, message = "service name is required"))]
    pub name: String,
    /// Number of tasks to keep running.
    #[serde(default = "default_desired_count")]
    #[validate(range(max = 5000, message = "desired count must not exceed 5000"))]
    pub desired_count: u32,
    /// Give tasks a public IP (required in public subnets without NAT).
    #[serde(default = "default_true")]
    pub assign_public_ip: bool,
    /// Seconds to ignore failing load balancer health checks after a task starts.
    #[serde(default)]
    pub health_check_grace_period_secs: Option<u32>,
}

/// Task definition settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct TaskSpec {
    /// Task definition family. Defaults to `<service>-task`.
    #[serde(default)]
    pub family: Option<String>,
    /// CPU units (256 = 0.25 vCPU).
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in MiB.
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// Role the ECS agent uses to pull images and write logs.
    #[serde(default)]
    pub execution_role_arn: Option<String>,
    /// Role assumed by the application.
    #[serde(default)]
    pub task_role_arn: Option<String>,
    /// The single container of the task.
    #[serde(default)]
    #[validate(nested)]
    pub container: ContainerSpec,
}

/// Container settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ContainerSpec {
    /// Container name. Defaults to the service name.
    #[serde(default)]
    pub name: Option<String>,
    /// Image reference (`registry/repository:tag` or `@sha256:` digest).
    #[serde(default)]
    #[validate(length(min = 1, message = "image reference is required"))]
    pub image: String,
    /// Port the container listens on.
    #[serde(default)]
    #[validate(
        required(message = "container port is required"),
        range(min = 1, max = 65535, message = "port must be between 1 and 65535")
    )]
    pub port: Option<u32>,
    /// Environment variables. Values may reference `${VAR}`.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,
}

/// VPC networking shared by the service and the load balancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct NetworkSpec {
    /// VPC the target group lives in.
    #[serde(default)]
    #[validate(length(min = 1, message = "VPC id is required"))]
    pub vpc_id: String,
    /// Subnets for tasks and the load balancer.
    #[serde(default)]
    #[validate(length(min = 1, message = "at least one subnet id is required"))]
    pub subnets: Vec<String>,
    /// Security groups attached to tasks.
    #[serde(default)]
    pub security_groups: Vec<String>,
}

/// Application load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct LoadBalancerSpec {
    /// Load balancer name. Defaults to `<service>-alb`.
    #[serde(default)]
    pub name: Option<String>,
    /// Internet-facing or internal.
    #[serde(default)]
    pub scheme: LoadBalancerScheme,
    /// HTTP listener port.
    #[serde(default = "default_listener_port")]
    #[validate(range(min = 1, max = 65535, message = "listener port must be between 1 and 65535"))]
    pub listener_port: u32,
    /// Security groups for the load balancer. Defaults to `network.security_groups`.
    #[serde(default)]
    pub security_groups: Option<Vec<String>>,
}

/// Load balancer scheme.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerScheme {
    /// Reachable from the internet.
    #[default]
    InternetFacing,
    /// Reachable only inside the VPC.
    Internal,
}

/// Target group settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct TargetGroupSpec {
    /// Target group name. Defaults to `<service>-tg`.
    #[serde(default)]
    pub name: Option<String>,
    /// Load balancer health check.
    #[serde(default)]
    #[validate(nested)]
    pub health_check: HealthCheckSpec,
}

/// Load balancer health check settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct HealthCheckSpec {
    /// HTTP path probed on each target.
    #[serde(default = "default_health_path")]
    #[validate(length(min = 1, message = "health check path is required"))]
    pub path: String,
    /// Seconds between checks.
    #[serde(default = "default_health_interval")]
    #[validate(range(min = 5, max = 300, message = "interval must be between 5 and 300 seconds"))]
    pub interval_secs: u32,
    /// Seconds before a check counts as failed.
    #[serde(default = "default_health_timeout")]
    #[validate(range(min = 2, max = 120, message = "timeout must be between 2 and 120 seconds"))]
    pub timeout_secs: u32,
    /// Consecutive successes before a target is healthy.
    #[serde(default = "default_healthy_threshold")]
    #[validate(range(min = 2, max = 10, message = "threshold must be between 2 and 10"))]
    pub healthy_threshold: u32,
    /// Consecutive failures before a target is unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    #[validate(range(min = 2, max = 10, message = "threshold must be between 2 and 10"))]
    pub unhealthy_threshold: u32,
    /// HTTP codes counted as healthy (`200`, `200-399`).
    #[serde(default = "default_matcher")]
    pub matcher: String,
}

/// Retry, concurrency and convergence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RolloutSpec {
    /// Retry policy for transient cloud errors.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySpec,
    /// Convergence polling settings.
    #[serde(default)]
    #[validate(nested)]
    pub convergence: ConvergenceSpec,
    /// Maximum operations in flight at once.
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1, max = 16, message = "max concurrency must be between 1 and 16"))]
    pub max_concurrency: u32,
    /// Keep applying independent chains after a permanent failure.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Retry policy for transient errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetrySpec {
    /// Total attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20, message = "max attempts must be between 1 and 20"))]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Convergence polling settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ConvergenceSpec {
    /// Seconds between polls.
    #[serde(default = "default_poll_interval")]
    #[validate(range(min = 1, message = "poll interval must be at least 1 second"))]
    pub interval_secs: u64,
    /// Seconds before the run is declared timed out.
    #[serde(default = "default_convergence_timeout")]
    #[validate(range(min = 1, message = "timeout must be at least 1 second"))]
    pub timeout_secs: u64,
    /// Times the running count may fall back below desired before the
    /// service is reported as degraded.
    #[serde(default = "default_flap_threshold")]
    #[validate(range(min = 1, message = "flap threshold must be at least 1"))]
    pub flap_threshold: u32,
}

/// State backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSpec {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Bucket name (s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// Key prefix (s3 backend).
    #[serde(default)]
    pub prefix: Option<String>,
    /// Bucket region (s3 backend).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

// Default value functions

const fn default_desired_count() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_cpu() -> u32 {
    256
}

const fn default_memory() -> u32 {
    512
}

const fn default_listener_port() -> u32 {
    80
}

fn default_health_path() -> String {
    String::from("/")
}

const fn default_health_interval() -> u32 {
    30
}

const fn default_health_timeout() -> u32 {
    5
}

const fn default_healthy_threshold() -> u32 {
    2
}

const fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_matcher() -> String {
    String::from("200-399")
}

const fn default_max_concurrency() -> u32 {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    20_000
}

const fn default_poll_interval() -> u64 {
    15
}

const fn default_convergence_timeout() -> u64 {
    600
}

const fn default_flap_threshold() -> u32 {
    3
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            desired_count: default_desired_count(),
            assign_public_ip: true,
            health_check_grace_period_secs: None,
        }
    }
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            family: None,
            cpu: default_cpu(),
            memory: default_memory(),
            execution_role_arn: None,
            task_role_arn: None,
            container: ContainerSpec::default(),
        }
    }
}

impl Default for LoadBalancerSpec {
    fn default() -> Self {
        Self {
            name: None,
            scheme: LoadBalancerScheme::default(),
            listener_port: default_listener_port(),
            security_groups: None,
        }
    }
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            matcher: default_matcher(),
        }
    }
}

impl Default for RolloutSpec {
    fn default() -> Self {
        Self {
            retry: RetrySpec::default(),
            convergence: ConvergenceSpec::default(),
            max_concurrency: default_max_concurrency(),
            continue_on_error: false,
        }
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ConvergenceSpec {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            timeout_secs: default_convergence_timeout(),
            flap_threshold: default_flap_threshold(),
        }
    }
}

impl DeploymentSpec {
    /// Returns the task definition family, defaulting to `<service>-task`.
    #[must_use]
    pub fn task_family(&self) -> String {
        self.task
            .family
            .clone()
            .unwrap_or_else(|| format!("{}-task", self.service.name))
    }

    /// Returns the container name, defaulting to the service name.
    #[must_use]
    pub fn container_name(&self) -> String {
        self.task
            .container
            .name
            .clone()
            .unwrap_or_else(|| self.service.name.clone())
    }

    /// Returns the load balancer name, defaulting to `<service>-alb`.
    #[must_use]
    pub fn load_balancer_name(&self) -> String {
        self.load_balancer
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-alb", self.service.name))
    }

    /// Returns the target group name, defaulting to `<service>-tg`.
    #[must_use]
    pub fn target_group_name(&self) -> String {
        self.target_group
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-tg", self.service.name))
    }

    /// Returns the load balancer security groups, defaulting to the task ones.
    #[must_use]
    pub fn load_balancer_security_groups(&self) -> Vec<String> {
        self.load_balancer
            .security_groups
            .clone()
            .unwrap_or_else(|| self.network.security_groups.clone())
    }

    /// Returns the container port if it fits a TCP port number.
    #[must_use]
    pub fn container_port(&self) -> Option<u16> {
        self.task
            .container
            .port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
    }

    /// Returns the listener port if it fits a TCP port number.
    #[must_use]
    pub fn listener_port(&self) -> Option<u16> {
        u16::try_from(self.load_balancer.listener_port)
            .ok()
            .filter(|p| *p != 0)
    }

    /// Returns a `cluster/service` display name.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.cluster.name, self.service.name)
    }
}

impl LoadBalancerScheme {
    /// Returns the provider's string for this scheme.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InternetFacing => "internet-facing",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for LoadBalancerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for StateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}
