//! Control-plane boundary.
//!
//! Everything the orchestrator asks of the cloud goes through [`CloudApi`].
//! Describe calls return `Ok(None)` for resources that do not exist; delete
//! calls treat an already-missing resource as success so teardown can be
//! re-run after a partial failure.

use async_trait::async_trait;

use crate::error::Result;

use super::types::{
    ClusterInfo, ClusterParams, ListenerInfo, LoadBalancerInfo, LoadBalancerParams, Lookup,
    ServiceInfo, ServiceParams, TargetGroupInfo, TargetGroupParams, TargetHealthInfo,
    TaskDefinitionInfo, TaskDefinitionParams, TaskInfo,
};

/// Operations against the container orchestration and load balancing APIs.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Describes a cluster by name.
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterInfo>>;

    /// Creates a cluster. Creating an existing cluster returns it.
    async fn create_cluster(&self, params: &ClusterParams) -> Result<ClusterInfo>;

    /// Updates cluster settings.
    async fn update_cluster(&self, params: &ClusterParams) -> Result<ClusterInfo>;

    /// Deletes a cluster.
    async fn delete_cluster(&self, name: &str) -> Result<()>;

    /// Describes a target group.
    async fn describe_target_group(&self, lookup: Lookup<'_>) -> Result<Option<TargetGroupInfo>>;

    /// Creates a target group. Creating an identical group returns it.
    async fn create_target_group(&self, params: &TargetGroupParams) -> Result<TargetGroupInfo>;

    /// Updates a target group's health check.
    async fn modify_target_group(
        &self,
        arn: &str,
        params: &TargetGroupParams,
    ) -> Result<TargetGroupInfo>;

    /// Deletes a target group.
    async fn delete_target_group(&self, arn: &str) -> Result<()>;

    /// Reports the health of every registered target.
    async fn describe_target_health(&self, arn: &str) -> Result<Vec<TargetHealthInfo>>;

    /// Describes a load balancer.
    async fn describe_load_balancer(&self, lookup: Lookup<'_>) -> Result<Option<LoadBalancerInfo>>;

    /// Creates an application load balancer.
    async fn create_load_balancer(&self, params: &LoadBalancerParams) -> Result<LoadBalancerInfo>;

    /// Replaces a load balancer's subnets and security groups.
    async fn update_load_balancer(
        &self,
        arn: &str,
        params: &LoadBalancerParams,
    ) -> Result<LoadBalancerInfo>;

    /// Deletes a load balancer and its listeners.
    async fn delete_load_balancer(&self, arn: &str) -> Result<()>;

    /// Lists the listeners of a load balancer.
    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<ListenerInfo>>;

    /// Creates an HTTP listener forwarding to a target group.
    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        port: u16,
        target_group_arn: &str,
    ) -> Result<ListenerInfo>;

    /// Points a listener's default action at a target group.
    async fn update_listener(&self, listener_arn: &str, target_group_arn: &str) -> Result<ListenerInfo>;

    /// Deletes a listener.
    async fn delete_listener(&self, arn: &str) -> Result<()>;

    /// Describes the latest active revision of a family, or a revision by ARN.
    async fn describe_task_definition(&self, family_or_arn: &str) -> Result<Option<TaskDefinitionInfo>>;

    /// Registers a new task definition revision.
    async fn register_task_definition(
        &self,
        params: &TaskDefinitionParams,
    ) -> Result<TaskDefinitionInfo>;

    /// Deregisters a task definition revision.
    async fn deregister_task_definition(&self, arn: &str) -> Result<()>;

    /// Describes a service.
    async fn describe_service(&self, cluster: &str, service: &str) -> Result<Option<ServiceInfo>>;

    /// Creates a service behind a target group.
    async fn create_service(
        &self,
        params: &ServiceParams,
        task_definition_arn: &str,
        target_group_arn: &str,
    ) -> Result<ServiceInfo>;

    /// Updates a service's revision, count and network settings.
    async fn update_service(&self, params: &ServiceParams, task_definition_arn: &str) -> Result<ServiceInfo>;

    /// Scales a service to zero and deletes it.
    async fn delete_service(&self, cluster: &str, service: &str) -> Result<()>;

    /// Lists the running tasks of a service.
    async fn describe_service_tasks(&self, cluster: &str, service: &str) -> Result<Vec<TaskInfo>>;
}
