//! AWS implementation of [`CloudApi`].
//!
//! Wraps the ECS and Elastic Load Balancing v2 SDK clients and maps SDK
//! responses and errors onto the provider-neutral types in [`super::types`].

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ecs::types as ecs;
use aws_sdk_elasticloadbalancingv2::types as elb;
use std::fmt::Debug;
use tracing::{debug, info};

use crate::error::{CloudError, DeployError, Result};

use super::api::CloudApi;
use super::types::{
    ClusterInfo, ClusterParams, ContainerParams, HealthCheckParams, ListenerInfo,
    LoadBalancerInfo, LoadBalancerParams, Lookup, RolloutState, ServiceInfo, ServiceParams,
    TargetGroupInfo, TargetGroupParams, TargetHealthInfo, TaskDefinitionInfo,
    TaskDefinitionParams, TaskHealth, TaskInfo,
};

/// Maximum tasks per `DescribeTasks` call.
const DESCRIBE_TASKS_BATCH: usize = 100;

/// AWS control-plane client.
#[derive(Debug, Clone)]
pub struct AwsCloud {
    /// ECS client.
    ecs: aws_sdk_ecs::Client,
    /// Elastic Load Balancing v2 client.
    elb: aws_sdk_elasticloadbalancingv2::Client,
}

impl AwsCloud {
    /// Creates a client from the default credential chain.
    pub async fn new(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;

        info!(
            "Using AWS region: {}",
            config.region().map_or("<default>", |r| r.as_ref())
        );

        Self {
            ecs: aws_sdk_ecs::Client::new(&config),
            elb: aws_sdk_elasticloadbalancingv2::Client::new(&config),
        }
    }

    /// Creates a client from existing SDK clients.
    #[must_use]
    pub const fn with_clients(
        ecs: aws_sdk_ecs::Client,
        elb: aws_sdk_elasticloadbalancingv2::Client,
    ) -> Self {
        Self { ecs, elb }
    }

    async fn fetch_tasks(&self, cluster: &str, arns: &[String]) -> Result<Vec<TaskInfo>> {
        let mut tasks = Vec::with_capacity(arns.len());

        for chunk in arns.chunks(DESCRIBE_TASKS_BATCH) {
            let out = self
                .ecs
                .describe_tasks()
                .cluster(cluster)
                .set_tasks(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| classify("DescribeTasks", &e))?;

            tasks.extend(out.tasks().iter().map(task_info));
        }

        Ok(tasks)
    }
}

#[async_trait]
impl CloudApi for AwsCloud {
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterInfo>> {
        let out = self
            .ecs
            .describe_clusters()
            .clusters(name)
            .include(ecs::ClusterField::Settings)
            .send()
            .await
            .map_err(|e| classify("DescribeClusters", &e))?;

        Ok(out
            .clusters()
            .iter()
            .find(|c| c.cluster_name() == Some(name))
            .map(cluster_info))
    }

    async fn create_cluster(&self, params: &ClusterParams) -> Result<ClusterInfo> {
        debug!("Creating cluster: {}", params.name);

        let out = self
            .ecs
            .create_cluster()
            .cluster_name(&params.name)
            .settings(insights_setting(params.container_insights))
            .send()
            .await
            .map_err(|e| classify("CreateCluster", &e))?;

        out.cluster()
            .map(cluster_info)
            .ok_or_else(|| empty_response("CreateCluster"))
    }

    async fn update_cluster(&self, params: &ClusterParams) -> Result<ClusterInfo> {
        let out = self
            .ecs
            .update_cluster_settings()
            .cluster(&params.name)
            .settings(insights_setting(params.container_insights))
            .send()
            .await
            .map_err(|e| classify("UpdateClusterSettings", &e).read_after_write())?;

        out.cluster()
            .map(cluster_info)
            .ok_or_else(|| empty_response("UpdateClusterSettings"))
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        let result = self.ecs.delete_cluster().cluster(name).send().await;
        ignore_not_found(result.map(|_| ()).map_err(|e| classify("DeleteCluster", &e)))
    }

    async fn describe_target_group(&self, lookup: Lookup<'_>) -> Result<Option<TargetGroupInfo>> {
        let request = self.elb.describe_target_groups();
        let request = match lookup {
            Lookup::Name(name) => request.names(name),
            Lookup::Arn(arn) => request.target_group_arns(arn),
        };

        match request.send().await {
            Ok(out) => Ok(out.target_groups().first().map(target_group_info)),
            Err(e) => absent_if_not_found(classify("DescribeTargetGroups", &e)),
        }
    }

    async fn create_target_group(&self, params: &TargetGroupParams) -> Result<TargetGroupInfo> {
        debug!("Creating target group: {}", params.name);
        let health = &params.health_check;

        let out = self
            .elb
            .create_target_group()
            .name(&params.name)
            .protocol(elb::ProtocolEnum::Http)
            .port(i32::from(params.port))
            .vpc_id(&params.vpc_id)
            .target_type(elb::TargetTypeEnum::Ip)
            .health_check_protocol(elb::ProtocolEnum::Http)
            .health_check_path(&health.path)
            .health_check_interval_seconds(to_i32(health.interval_secs))
            .health_check_timeout_seconds(to_i32(health.timeout_secs))
            .healthy_threshold_count(to_i32(health.healthy_threshold))
            .unhealthy_threshold_count(to_i32(health.unhealthy_threshold))
            .matcher(elb::Matcher::builder().http_code(&health.matcher).build())
            .send()
            .await
            .map_err(|e| classify("CreateTargetGroup", &e))?;

        out.target_groups()
            .first()
            .map(target_group_info)
            .ok_or_else(|| empty_response("CreateTargetGroup"))
    }

    async fn modify_target_group(
        &self,
        arn: &str,
        params: &TargetGroupParams,
    ) -> Result<TargetGroupInfo> {
        let health = &params.health_check;

        let out = self
            .elb
            .modify_target_group()
            .target_group_arn(arn)
            .health_check_path(&health.path)
            .health_check_interval_seconds(to_i32(health.interval_secs))
            .health_check_timeout_seconds(to_i32(health.timeout_secs))
            .healthy_threshold_count(to_i32(health.healthy_threshold))
            .unhealthy_threshold_count(to_i32(health.unhealthy_threshold))
            .matcher(elb::Matcher::builder().http_code(&health.matcher).build())
            .send()
            .await
            .map_err(|e| classify("ModifyTargetGroup", &e).read_after_write())?;

        out.target_groups()
            .first()
            .map(target_group_info)
            .ok_or_else(|| empty_response("ModifyTargetGroup"))
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        let result = self.elb.delete_target_group().target_group_arn(arn).send().await;
        ignore_not_found(result.map(|_| ()).map_err(|e| classify("DeleteTargetGroup", &e)))
    }

    async fn describe_target_health(&self, arn: &str) -> Result<Vec<TargetHealthInfo>> {
        let out = self
            .elb
            .describe_target_health()
            .target_group_arn(arn)
            .send()
            .await
            .map_err(|e| classify("DescribeTargetHealth", &e))?;

        Ok(out
            .target_health_descriptions()
            .iter()
            .filter_map(|d| d.target_health())
            .map(|h| TargetHealthInfo {
                state: h.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
                reason: h.description().map(ToString::to_string),
            })
            .collect())
    }

    async fn describe_load_balancer(&self, lookup: Lookup<'_>) -> Result<Option<LoadBalancerInfo>> {
        let request = self.elb.describe_load_balancers();
        let request = match lookup {
            Lookup::Name(name) => request.names(name),
            Lookup::Arn(arn) => request.load_balancer_arns(arn),
        };

        match request.send().await {
            Ok(out) => Ok(out.load_balancers().first().map(load_balancer_info)),
            Err(e) => absent_if_not_found(classify("DescribeLoadBalancers", &e)),
        }
    }

    async fn create_load_balancer(&self, params: &LoadBalancerParams) -> Result<LoadBalancerInfo> {
        debug!("Creating load balancer: {}", params.name);

        let out = self
            .elb
            .create_load_balancer()
            .name(&params.name)
            .r#type(elb::LoadBalancerTypeEnum::Application)
            .scheme(elb::LoadBalancerSchemeEnum::from(params.scheme.as_str()))
            .ip_address_type(elb::IpAddressType::Ipv4)
            .set_subnets(Some(params.subnets.clone()))
            .set_security_groups(non_empty(&params.security_groups))
            .send()
            .await
            .map_err(|e| classify("CreateLoadBalancer", &e))?;

        out.load_balancers()
            .first()
            .map(load_balancer_info)
            .ok_or_else(|| empty_response("CreateLoadBalancer"))
    }

    async fn update_load_balancer(
        &self,
        arn: &str,
        params: &LoadBalancerParams,
    ) -> Result<LoadBalancerInfo> {
        self.elb
            .set_subnets()
            .load_balancer_arn(arn)
            .set_subnets(Some(params.subnets.clone()))
            .send()
            .await
            .map_err(|e| classify("SetSubnets", &e).read_after_write())?;

        if !params.security_groups.is_empty() {
            self.elb
                .set_security_groups()
                .load_balancer_arn(arn)
                .set_security_groups(Some(params.security_groups.clone()))
                .send()
                .await
                .map_err(|e| classify("SetSecurityGroups", &e).read_after_write())?;
        }

        self.describe_load_balancer(Lookup::Arn(arn))
            .await?
            .ok_or_else(|| DeployError::Cloud(CloudError::not_found("DescribeLoadBalancers", arn)))
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        let result = self.elb.delete_load_balancer().load_balancer_arn(arn).send().await;
        ignore_not_found(result.map(|_| ()).map_err(|e| classify("DeleteLoadBalancer", &e)))
    }

    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<ListenerInfo>> {
        match self
            .elb
            .describe_listeners()
            .load_balancer_arn(load_balancer_arn)
            .send()
            .await
        {
            Ok(out) => Ok(out.listeners().iter().map(listener_info).collect()),
            Err(e) => {
                let err = classify("DescribeListeners", &e);
                if err.is_not_found() {
                    Ok(Vec::new())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        port: u16,
        target_group_arn: &str,
    ) -> Result<ListenerInfo> {
        debug!("Creating listener on port {port}");

        let result = self
            .elb
            .create_listener()
            .load_balancer_arn(load_balancer_arn)
            .protocol(elb::ProtocolEnum::Http)
            .port(i32::from(port))
            .default_actions(forward_action(target_group_arn))
            .send()
            .await;

        match result {
            Ok(out) => out
                .listeners()
                .first()
                .map(listener_info)
                .ok_or_else(|| empty_response("CreateListener")),
            Err(e) => {
                let err = classify("CreateListener", &e);
                if !is_duplicate_listener(&err) {
                    return Err(err.read_after_write().into());
                }

                // a retried create whose first attempt landed
                debug!("Listener on port {port} already exists, adopting it");
                let listeners = self.describe_listeners(load_balancer_arn).await?;
                listener_on_port(listeners, port).ok_or_else(|| err.into())
            }
        }
    }

    async fn update_listener(&self, listener_arn: &str, target_group_arn: &str) -> Result<ListenerInfo> {
        let out = self
            .elb
            .modify_listener()
            .listener_arn(listener_arn)
            .default_actions(forward_action(target_group_arn))
            .send()
            .await
            .map_err(|e| classify("ModifyListener", &e).read_after_write())?;

        out.listeners()
            .first()
            .map(listener_info)
            .ok_or_else(|| empty_response("ModifyListener"))
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        let result = self.elb.delete_listener().listener_arn(arn).send().await;
        ignore_not_found(result.map(|_| ()).map_err(|e| classify("DeleteListener", &e)))
    }

    async fn describe_task_definition(&self, family_or_arn: &str) -> Result<Option<TaskDefinitionInfo>> {
        match self
            .ecs
            .describe_task_definition()
            .task_definition(family_or_arn)
            .send()
            .await
        {
            Ok(out) => Ok(out
                .task_definition()
                .filter(|td| td.status() != Some(&ecs::TaskDefinitionStatus::Inactive))
                .map(task_definition_info)),
            // ECS reports an unknown family as a generic client error
            Err(e) if e.code() == Some("ClientException") => Ok(None),
            Err(e) => Err(classify("DescribeTaskDefinition", &e).into()),
        }
    }

    async fn register_task_definition(
        &self,
        params: &TaskDefinitionParams,
    ) -> Result<TaskDefinitionInfo> {
        debug!("Registering task definition: {}", params.family);
        let container = &params.container;

        let environment: Vec<ecs::KeyValuePair> = container
            .environment
            .iter()
            .map(|(name, value)| ecs::KeyValuePair::builder().name(name).value(value).build())
            .collect();

        let definition = ecs::ContainerDefinition::builder()
            .name(&container.name)
            .image(&container.image)
            .essential(true)
            .port_mappings(
                ecs::PortMapping::builder()
                    .container_port(i32::from(container.port))
                    .protocol(ecs::TransportProtocol::Tcp)
                    .build(),
            )
            .set_environment(Some(environment))
            .set_command(non_empty(&container.command))
            .build();

        let out = self
            .ecs
            .register_task_definition()
            .family(&params.family)
            .cpu(params.cpu.to_string())
            .memory(params.memory.to_string())
            .network_mode(ecs::NetworkMode::Awsvpc)
            .requires_compatibilities(ecs::Compatibility::Fargate)
            .set_execution_role_arn(params.execution_role_arn.clone())
            .set_task_role_arn(params.task_role_arn.clone())
            .container_definitions(definition)
            .send()
            .await
            .map_err(|e| classify("RegisterTaskDefinition", &e))?;

        out.task_definition()
            .map(task_definition_info)
            .ok_or_else(|| empty_response("RegisterTaskDefinition"))
    }

    async fn deregister_task_definition(&self, arn: &str) -> Result<()> {
        let result = self
            .ecs
            .deregister_task_definition()
            .task_definition(arn)
            .send()
            .await;
        ignore_not_found(result.map(|_| ()).map_err(|e| classify("DeregisterTaskDefinition", &e)))
    }

    async fn describe_service(&self, cluster: &str, service: &str) -> Result<Option<ServiceInfo>> {
        match self
            .ecs
            .describe_services()
            .cluster(cluster)
            .services(service)
            .send()
            .await
        {
            Ok(out) => Ok(out
                .services()
                .iter()
                .find(|s| s.service_name() == Some(service))
                .map(|s| service_info(s, cluster))),
            Err(e) => absent_if_not_found(classify("DescribeServices", &e)),
        }
    }

    async fn create_service(
        &self,
        params: &ServiceParams,
        task_definition_arn: &str,
        target_group_arn: &str,
    ) -> Result<ServiceInfo> {
        debug!("Creating service: {}/{}", params.cluster, params.name);

        let load_balancer = ecs::LoadBalancer::builder()
            .target_group_arn(target_group_arn)
            .container_name(&params.container_name)
            .container_port(i32::from(params.container_port))
            .build();

        let out = self
            .ecs
            .create_service()
            .cluster(&params.cluster)
            .service_name(&params.name)
            .task_definition(task_definition_arn)
            .desired_count(to_i32(params.desired_count))
            .launch_type(ecs::LaunchType::Fargate)
            .load_balancers(load_balancer)
            .network_configuration(network_configuration(params)?)
            .set_health_check_grace_period_seconds(params.health_check_grace_period_secs.map(to_i32))
            .client_token(&params.client_token)
            .send()
            .await
            .map_err(|e| classify("CreateService", &e).read_after_write())?;

        out.service()
            .map(|s| service_info(s, &params.cluster))
            .ok_or_else(|| empty_response("CreateService"))
    }

    async fn update_service(&self, params: &ServiceParams, task_definition_arn: &str) -> Result<ServiceInfo> {
        debug!("Updating service: {}/{}", params.cluster, params.name);

        let out = self
            .ecs
            .update_service()
            .cluster(&params.cluster)
            .service(&params.name)
            .task_definition(task_definition_arn)
            .desired_count(to_i32(params.desired_count))
            .network_configuration(network_configuration(params)?)
            .set_health_check_grace_period_seconds(params.health_check_grace_period_secs.map(to_i32))
            .send()
            .await
            .map_err(|e| classify("UpdateService", &e).read_after_write())?;

        out.service()
            .map(|s| service_info(s, &params.cluster))
            .ok_or_else(|| empty_response("UpdateService"))
    }

    async fn delete_service(&self, cluster: &str, service: &str) -> Result<()> {
        let result = self
            .ecs
            .delete_service()
            .cluster(cluster)
            .service(service)
            .force(true)
            .send()
            .await;
        ignore_not_found(result.map(|_| ()).map_err(|e| classify("DeleteService", &e)))
    }

    async fn describe_service_tasks(&self, cluster: &str, service: &str) -> Result<Vec<TaskInfo>> {
        let out = self
            .ecs
            .list_tasks()
            .cluster(cluster)
            .service_name(service)
            .desired_status(ecs::DesiredStatus::Running)
            .send()
            .await;

        let arns = match out {
            Ok(out) => out.task_arns().to_vec(),
            Err(e) => {
                let err = classify("ListTasks", &e);
                return if err.is_not_found() { Ok(Vec::new()) } else { Err(err.into()) };
            }
        };

        if arns.is_empty() {
            return Ok(Vec::new());
        }

        self.fetch_tasks(cluster, &arns).await
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Maps an SDK error onto the transient/permanent taxonomy.
fn classify<E>(operation: &str, err: &SdkError<E>) -> CloudError
where
    E: ProvideErrorMetadata + Debug,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            CloudError::network(operation, format!("{err:?}"))
        }
        SdkError::ResponseError(_) => CloudError::Unavailable {
            operation: operation.to_string(),
            message: String::from("malformed response"),
        },
        SdkError::ServiceError(context) => classify_code(
            operation,
            context.err().code().unwrap_or("Unknown"),
            context.err().message().unwrap_or_default(),
            context.raw().status().as_u16(),
        ),
        _ => CloudError::Api {
            operation: operation.to_string(),
            code: String::from("SdkError"),
            message: format!("{err:?}"),
        },
    }
}

/// Classifies a service error by code, message and HTTP status.
pub(crate) fn classify_code(operation: &str, code: &str, message: &str, status: u16) -> CloudError {
    let operation = operation.to_string();
    let message = message.to_string();

    match code {
        "ThrottlingException" | "Throttling" | "TooManyRequestsException"
        | "RequestLimitExceeded" | "PriorRequestNotComplete" => {
            CloudError::Throttled { operation, message }
        }

        "ServerException" | "ServiceUnavailable" | "ServiceUnavailableException"
        | "InternalFailure" | "InternalError" => CloudError::Unavailable { operation, message },

        // dependants still draining, or a dependency not yet propagated
        "ResourceInUse" | "ResourceInUseException" | "ClusterContainsServicesException"
        | "ClusterContainsTasksException" | "UpdateInProgressException" => {
            CloudError::NotYetVisible { operation, message }
        }

        "AccessDeniedException" | "AccessDenied" | "UnauthorizedOperation"
        | "UnrecognizedClientException" | "InvalidClientTokenId" | "ExpiredTokenException"
        | "AuthFailure" => CloudError::AccessDenied { operation, message },

        "ClusterNotFoundException" | "ServiceNotFoundException" | "ServiceNotActiveException"
        | "TargetGroupNotFound" | "LoadBalancerNotFound" | "ListenerNotFound" => {
            CloudError::NotFound { operation, message }
        }

        "InvalidParameterException" | "ValidationError" | "InvalidConfigurationRequest"
        | "InvalidSubnet" | "InvalidSecurityGroup" | "InvalidScheme" => {
            if is_propagation_gap(&message) {
                CloudError::NotYetVisible { operation, message }
            } else {
                CloudError::InvalidParameter { operation, message }
            }
        }

        _ if status == 429 => CloudError::Throttled { operation, message },
        _ if status >= 500 => CloudError::Unavailable { operation, message },
        _ if status == 401 || status == 403 => CloudError::AccessDenied { operation, message },

        _ => CloudError::Api {
            operation,
            code: code.to_string(),
            message,
        },
    }
}

/// Parameter errors that clear once a just-created dependency propagates.
fn is_propagation_gap(message: &str) -> bool {
    const GAPS: &[&str] = &[
        "does not have an associated load balancer",
        "unable to assume the role",
        "Unable to assume role",
        "is currently in use",
    ];
    GAPS.iter().any(|gap| message.contains(gap))
}

fn is_duplicate_listener(err: &CloudError) -> bool {
    matches!(err, CloudError::Api { code, .. } if code == "DuplicateListener")
}

fn listener_on_port(listeners: Vec<ListenerInfo>, port: u16) -> Option<ListenerInfo> {
    listeners.into_iter().find(|l| l.port == port)
}

fn absent_if_not_found<T>(err: CloudError) -> Result<Option<T>> {
    if err.is_not_found() {
        Ok(None)
    } else {
        Err(err.into())
    }
}

fn ignore_not_found(result: std::result::Result<(), CloudError>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!("Resource already gone: {e}");
            Ok(())
        }
        other => other.map_err(DeployError::from),
    }
}

fn empty_response(operation: &str) -> DeployError {
    DeployError::Cloud(CloudError::Api {
        operation: operation.to_string(),
        code: String::from("EmptyResponse"),
        message: String::from("response did not include the resource"),
    })
}

// ============================================================================
// Request builders
// ============================================================================

fn insights_setting(enabled: bool) -> ecs::ClusterSetting {
    ecs::ClusterSetting::builder()
        .name(ecs::ClusterSettingName::ContainerInsights)
        .value(if enabled { "enabled" } else { "disabled" })
        .build()
}

fn forward_action(target_group_arn: &str) -> elb::Action {
    elb::Action::builder()
        .r#type(elb::ActionTypeEnum::Forward)
        .target_group_arn(target_group_arn)
        .build()
}

fn network_configuration(params: &ServiceParams) -> Result<ecs::NetworkConfiguration> {
    let vpc = ecs::AwsVpcConfiguration::builder()
        .set_subnets(Some(params.subnets.clone()))
        .set_security_groups(non_empty(&params.security_groups))
        .assign_public_ip(if params.assign_public_ip {
            ecs::AssignPublicIp::Enabled
        } else {
            ecs::AssignPublicIp::Disabled
        })
        .build()
        .map_err(|e| {
            DeployError::Cloud(CloudError::InvalidParameter {
                operation: String::from("BuildNetworkConfiguration"),
                message: e.to_string(),
            })
        })?;

    Ok(ecs::NetworkConfiguration::builder()
        .awsvpc_configuration(vpc)
        .build())
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

// ============================================================================
// Response mapping
// ============================================================================

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_port(value: Option<i32>) -> u16 {
    value.and_then(|p| u16::try_from(p).ok()).unwrap_or_default()
}

fn owned(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn cluster_info(cluster: &ecs::Cluster) -> ClusterInfo {
    ClusterInfo {
        name: owned(cluster.cluster_name()),
        arn: owned(cluster.cluster_arn()),
        status: owned(cluster.status()),
        active_services: to_u32(cluster.active_services_count()),
        container_insights: cluster.settings().iter().any(|s| {
            s.name() == Some(&ecs::ClusterSettingName::ContainerInsights)
                && matches!(s.value(), Some("enabled" | "enhanced"))
        }),
    }
}

fn target_group_info(group: &elb::TargetGroup) -> TargetGroupInfo {
    TargetGroupInfo {
        name: owned(group.target_group_name()),
        arn: owned(group.target_group_arn()),
        port: to_port(group.port()),
        vpc_id: owned(group.vpc_id()),
        health_check: HealthCheckParams {
            path: owned(group.health_check_path()),
            interval_secs: group.health_check_interval_seconds().map_or(0, to_u32),
            timeout_secs: group.health_check_timeout_seconds().map_or(0, to_u32),
            healthy_threshold: group.healthy_threshold_count().map_or(0, to_u32),
            unhealthy_threshold: group.unhealthy_threshold_count().map_or(0, to_u32),
            matcher: owned(group.matcher().and_then(|m| m.http_code())),
        },
        load_balancer_arns: group.load_balancer_arns().to_vec(),
    }
}

fn load_balancer_info(lb: &elb::LoadBalancer) -> LoadBalancerInfo {
    LoadBalancerInfo {
        name: owned(lb.load_balancer_name()),
        arn: owned(lb.load_balancer_arn()),
        dns_name: owned(lb.dns_name()),
        scheme: owned(lb.scheme().map(elb::LoadBalancerSchemeEnum::as_str)),
        state: owned(lb.state().and_then(|s| s.code()).map(elb::LoadBalancerStateEnum::as_str)),
        subnets: lb
            .availability_zones()
            .iter()
            .filter_map(|az| az.subnet_id())
            .map(ToString::to_string)
            .collect(),
        security_groups: lb.security_groups().to_vec(),
    }
}

fn listener_info(listener: &elb::Listener) -> ListenerInfo {
    ListenerInfo {
        arn: owned(listener.listener_arn()),
        load_balancer_arn: owned(listener.load_balancer_arn()),
        port: to_port(listener.port()),
        target_group_arn: listener
            .default_actions()
            .iter()
            .find_map(|a| a.target_group_arn())
            .map(ToString::to_string),
    }
}

fn task_definition_info(td: &ecs::TaskDefinition) -> TaskDefinitionInfo {
    let container = td.container_definitions().first().map_or_else(
        || ContainerParams {
            name: String::new(),
            image: String::new(),
            port: 0,
            environment: std::collections::BTreeMap::new(),
            command: Vec::new(),
        },
        |c| ContainerParams {
            name: owned(c.name()),
            image: owned(c.image()),
            port: to_port(c.port_mappings().first().and_then(ecs::PortMapping::container_port)),
            environment: c
                .environment()
                .iter()
                .filter_map(|kv| Some((kv.name()?.to_string(), owned(kv.value()))))
                .collect(),
            command: c.command().to_vec(),
        },
    );

    TaskDefinitionInfo {
        arn: owned(td.task_definition_arn()),
        revision: to_u32(td.revision()),
        params: TaskDefinitionParams {
            family: owned(td.family()),
            cpu: td.cpu().and_then(|c| c.parse().ok()).unwrap_or_default(),
            memory: td.memory().and_then(|m| m.parse().ok()).unwrap_or_default(),
            execution_role_arn: td.execution_role_arn().map(ToString::to_string),
            task_role_arn: td.task_role_arn().map(ToString::to_string),
            container,
        },
    }
}

fn service_info(service: &ecs::Service, cluster: &str) -> ServiceInfo {
    let vpc = service
        .network_configuration()
        .and_then(ecs::NetworkConfiguration::awsvpc_configuration);

    let primary = service
        .deployments()
        .iter()
        .find(|d| d.status() == Some("PRIMARY"));

    let rollout = primary
        .and_then(ecs::Deployment::rollout_state)
        .and_then(|state| match state {
            ecs::DeploymentRolloutState::InProgress => Some(RolloutState::InProgress),
            ecs::DeploymentRolloutState::Completed => Some(RolloutState::Completed),
            ecs::DeploymentRolloutState::Failed => Some(RolloutState::Failed),
            _ => None,
        });

    ServiceInfo {
        name: owned(service.service_name()),
        arn: owned(service.service_arn()),
        cluster: cluster.to_string(),
        status: owned(service.status()),
        desired_count: to_u32(service.desired_count()),
        running_count: to_u32(service.running_count()),
        pending_count: to_u32(service.pending_count()),
        task_definition_arn: owned(service.task_definition()),
        target_group_arns: service
            .load_balancers()
            .iter()
            .filter_map(ecs::LoadBalancer::target_group_arn)
            .map(ToString::to_string)
            .collect(),
        subnets: vpc.map(|v| v.subnets().to_vec()).unwrap_or_default(),
        security_groups: vpc.map(|v| v.security_groups().to_vec()).unwrap_or_default(),
        assign_public_ip: vpc
            .and_then(ecs::AwsVpcConfiguration::assign_public_ip)
            .is_some_and(|a| *a == ecs::AssignPublicIp::Enabled),
        health_check_grace_period_secs: service.health_check_grace_period_seconds().map(to_u32),
        rollout,
        deployments: u32::try_from(service.deployments().len()).unwrap_or(u32::MAX),
    }
}

fn task_info(task: &ecs::Task) -> TaskInfo {
    TaskInfo {
        arn: owned(task.task_arn()),
        last_status: owned(task.last_status()),
        health: match task.health_status() {
            Some(ecs::HealthStatus::Healthy) => TaskHealth::Healthy,
            Some(ecs::HealthStatus::Unhealthy) => TaskHealth::Unhealthy,
            _ => TaskHealth::Unknown,
        },
        task_definition_arn: owned(task.task_definition_arn()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_throttling() {
        let err = classify_code("CreateService", "ThrottlingException", "Rate exceeded", 400);
        assert!(matches!(err, CloudError::Throttled { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_access_denied() {
        let err = classify_code("CreateCluster", "AccessDeniedException", "not authorized", 400);
        assert!(matches!(err, CloudError::AccessDenied { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify_code("DescribeTargetGroups", "TargetGroupNotFound", "", 400);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_propagation_gap() {
        let err = classify_code(
            "CreateService",
            "InvalidParameterException",
            "The target group with targetGroupArn arn:... does not have an associated load balancer.",
            400,
        );
        assert!(matches!(err, CloudError::NotYetVisible { .. }));

        let err = classify_code("CreateService", "InvalidParameterException", "bad cpu", 400);
        assert!(matches!(err, CloudError::InvalidParameter { .. }));
    }

    #[test]
    fn test_duplicate_listener_is_adopted_by_port() {
        let err = classify_code("CreateListener", "DuplicateListener", "A listener already exists", 400);
        assert!(is_duplicate_listener(&err));
        assert!(!is_duplicate_listener(&classify_code("CreateListener", "TooManyListeners", "", 400)));

        let listener = |arn: &str, port| ListenerInfo {
            arn: arn.to_string(),
            load_balancer_arn: String::from("lb"),
            port,
            target_group_arn: Some(String::from("tg")),
        };
        let found = listener_on_port(vec![listener("a", 443), listener("b", 80)], 80).unwrap();
        assert_eq!(found.arn, "b");
        assert!(listener_on_port(vec![listener("a", 443)], 80).is_none());
    }

    #[test]
    fn test_classify_by_status() {
        assert!(classify_code("X", "SlowDown", "", 429).is_transient());
        assert!(classify_code("X", "Whatever", "", 503).is_transient());
        assert!(matches!(
            classify_code("X", "Forbidden", "", 403),
            CloudError::AccessDenied { .. }
        ));
        assert!(matches!(classify_code("X", "Odd", "", 400), CloudError::Api { .. }));
    }

    #[test]
    fn test_classify_draining_cluster() {
        let err = classify_code("DeleteCluster", "ClusterContainsServicesException", "", 400);
        assert!(err.is_transient());
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(CloudError::not_found("DeleteService", "gone"))).is_ok());
        assert!(ignore_not_found(Err(CloudError::access_denied("DeleteService", "no"))).is_err());
    }
}
