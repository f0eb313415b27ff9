//! Diff engine for comparing desired vs observed state.
//!
//! Absent resources are created, resources whose parameters differ are
//! updated, and resources that exist but are not described are left alone.
//! Changes the control plane cannot apply in place fail planning.

use std::fmt::Display;
use tracing::debug;

use crate::aws::{
    ClusterInfo, ClusterParams, ContainerParams, HealthCheckParams, ListenerInfo, ListenerParams,
    LoadBalancerInfo, LoadBalancerParams, ObservedState, ServiceInfo, ServiceParams,
    TargetGroupInfo, TargetGroupParams, TaskDefinitionInfo, TaskDefinitionParams,
};
use crate::config::{DeploymentSpec, SpecHasher};
use crate::error::{ConfigError, PlanError, Result};

use super::plan::{FieldChange, Operation, OperationKind, Plan, ResourceKind, ResourceParams};

/// Desired parameters of every managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    /// Cluster.
    pub cluster: ClusterParams,
    /// Target group.
    pub target_group: TargetGroupParams,
    /// Load balancer.
    pub load_balancer: LoadBalancerParams,
    /// Listener.
    pub listener: ListenerParams,
    /// Task definition.
    pub task_definition: TaskDefinitionParams,
    /// Service.
    pub service: ServiceParams,
}

/// Whether a plan may create the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanMode {
    /// Create whatever is missing.
    #[default]
    Deploy,
    /// Only change an existing service.
    Update,
}

/// Engine for computing plans from desired and observed state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Descriptor hasher.
    hasher: SpecHasher,
}

/// What to do to one resource, before dependencies are known.
struct Step {
    kind: OperationKind,
    changes: Vec<FieldChange>,
    reason: String,
}

impl DesiredState {
    /// Derives resource parameters from a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a port does not fit a TCP port number.
    pub fn from_spec(spec: &DeploymentSpec, client_token: &str) -> Result<Self> {
        let container_port = spec.container_port().ok_or_else(|| {
            ConfigError::validation("port must be between 1 and 65535", "task.container.port")
        })?;
        let listener_port = spec.listener_port().ok_or_else(|| {
            ConfigError::validation(
                "port must be between 1 and 65535",
                "load_balancer.listener_port",
            )
        })?;

        let health = &spec.target_group.health_check;

        Ok(Self {
            cluster: ClusterParams {
                name: spec.cluster.name.clone(),
                container_insights: spec.cluster.container_insights,
            },
            target_group: TargetGroupParams {
                name: spec.target_group_name(),
                port: container_port,
                vpc_id: spec.network.vpc_id.clone(),
                health_check: HealthCheckParams {
                    path: health.path.clone(),
                    interval_secs: health.interval_secs,
                    timeout_secs: health.timeout_secs,
                    healthy_threshold: health.healthy_threshold,
                    unhealthy_threshold: health.unhealthy_threshold,
                    matcher: health.matcher.clone(),
                },
            },
            load_balancer: LoadBalancerParams {
                name: spec.load_balancer_name(),
                scheme: spec.load_balancer.scheme,
                subnets: spec.network.subnets.clone(),
                security_groups: spec.load_balancer_security_groups(),
            },
            listener: ListenerParams { port: listener_port },
            task_definition: TaskDefinitionParams {
                family: spec.task_family(),
                cpu: spec.task.cpu,
                memory: spec.task.memory,
                execution_role_arn: spec.task.execution_role_arn.clone(),
                task_role_arn: spec.task.task_role_arn.clone(),
                container: ContainerParams {
                    name: spec.container_name(),
                    image: spec.task.container.image.clone(),
                    port: container_port,
                    environment: spec.task.container.environment.clone(),
                    command: spec.task.container.command.clone(),
                },
            },
            service: ServiceParams {
                cluster: spec.cluster.name.clone(),
                name: spec.service.name.clone(),
                desired_count: spec.service.desired_count,
                subnets: spec.network.subnets.clone(),
                security_groups: spec.network.security_groups.clone(),
                assign_public_ip: spec.service.assign_public_ip,
                container_name: spec.container_name(),
                container_port,
                health_check_grace_period_secs: spec.service.health_check_grace_period_secs,
                client_token: client_token.to_string(),
            },
        })
    }
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: SpecHasher::new(),
        }
    }

    /// Computes the plan that moves `observed` to what `spec` describes.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::ImmutableChange` if a field changed that cannot be
    /// updated in place, and `PlanError::NotDeployed` in update mode when the
    /// service does not exist.
    pub fn plan(
        &self,
        spec: &DeploymentSpec,
        observed: &ObservedState,
        mode: PlanMode,
    ) -> Result<Plan> {
        if mode == PlanMode::Update && observed.service.is_none() {
            return Err(PlanError::NotDeployed {
                cluster: spec.cluster.name.clone(),
                service: spec.service.name.clone(),
            }
            .into());
        }

        let desired = DesiredState::from_spec(spec, &self.hasher.service_client_token(spec))?;
        let mut ops = Vec::new();

        let cluster = add(
            &mut ops,
            ResourceKind::Cluster,
            &desired.cluster.name,
            ResourceParams::Cluster(desired.cluster.clone()),
            diff_cluster(&desired.cluster, observed.cluster.as_ref()),
            Vec::new(),
        );

        let target_group = add(
            &mut ops,
            ResourceKind::TargetGroup,
            &desired.target_group.name,
            ResourceParams::TargetGroup(desired.target_group.clone()),
            diff_target_group(&desired.target_group, observed.target_group.as_ref())?,
            Vec::new(),
        );
        // an updated target group keeps its ARN; only a new one rewires dependants
        let target_group_created =
            target_group.is_some_and(|index| ops[index].kind == OperationKind::Create);

        let load_balancer = add(
            &mut ops,
            ResourceKind::LoadBalancer,
            &desired.load_balancer.name,
            ResourceParams::LoadBalancer(desired.load_balancer.clone()),
            diff_load_balancer(&desired.load_balancer, observed.load_balancer.as_ref())?,
            Vec::new(),
        );

        let listener = add(
            &mut ops,
            ResourceKind::Listener,
            &format!("{}:{}", desired.load_balancer.name, desired.listener.port),
            ResourceParams::Listener(desired.listener.clone()),
            diff_listener(
                observed.listener.as_ref(),
                observed.target_group.as_ref(),
                target_group_created,
            ),
            deps(&[load_balancer, target_group]),
        );

        let task_definition = add(
            &mut ops,
            ResourceKind::TaskDefinition,
            &desired.task_definition.family,
            ResourceParams::TaskDefinition(desired.task_definition.clone()),
            diff_task_definition(&desired.task_definition, observed.task_definition.as_ref()),
            Vec::new(),
        );

        let service_step = diff_service(
            &desired.service,
            observed,
            target_group_created,
            task_definition.is_some(),
        )?;
        let service_deps = match service_step.as_ref().map(|s| s.kind) {
            Some(OperationKind::Create) => deps(&[cluster, task_definition, listener]),
            _ => deps(&[task_definition, listener]),
        };
        add(
            &mut ops,
            ResourceKind::Service,
            &desired.service.name,
            ResourceParams::Service(desired.service.clone()),
            service_step,
            service_deps,
        );

        let plan = Plan::new(self.hasher.hash_spec(spec), ops)?;
        debug!("Planned {} operations for {}", plan.len(), spec.qualified_name());
        Ok(plan)
    }
}

fn add(
    ops: &mut Vec<Operation>,
    resource: ResourceKind,
    name: &str,
    params: ResourceParams,
    step: Option<Step>,
    depends_on: Vec<usize>,
) -> Option<usize> {
    let step = step?;
    let index = ops.len();
    ops.push(Operation {
        index,
        resource,
        kind: step.kind,
        name: name.to_string(),
        params,
        changes: step.changes,
        reason: step.reason,
        depends_on,
    });
    Some(index)
}

fn deps(indices: &[Option<usize>]) -> Vec<usize> {
    indices.iter().flatten().copied().collect()
}

impl Step {
    fn create(what: &str) -> Option<Self> {
        Some(Self {
            kind: OperationKind::Create,
            changes: Vec::new(),
            reason: format!("{what} does not exist"),
        })
    }

    fn update(changes: Vec<FieldChange>) -> Option<Self> {
        if changes.is_empty() {
            return None;
        }
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        Some(Self {
            kind: OperationKind::Update,
            reason: format!("{} changed", fields.join(", ")),
            changes,
        })
    }
}

fn change(field: &str, observed: impl Display, desired: impl Display) -> FieldChange {
    FieldChange {
        field: field.to_string(),
        observed: observed.to_string(),
        desired: desired.to_string(),
    }
}

fn compare<T: PartialEq + Display>(changes: &mut Vec<FieldChange>, field: &str, observed: T, desired: T) {
    if observed != desired {
        changes.push(change(field, observed, desired));
    }
}

fn compare_sets(changes: &mut Vec<FieldChange>, field: &str, observed: &[String], desired: &[String]) {
    let mut a = observed.to_vec();
    let mut b = desired.to_vec();
    a.sort();
    b.sort();
    if a != b {
        changes.push(change(field, a.join(","), b.join(",")));
    }
}

fn immutable(resource: &str, field: &str, observed: impl Display, desired: impl Display) -> PlanError {
    PlanError::ImmutableChange {
        resource: resource.to_string(),
        field: field.to_string(),
        observed: observed.to_string(),
        desired: desired.to_string(),
    }
}

fn diff_cluster(desired: &ClusterParams, observed: Option<&ClusterInfo>) -> Option<Step> {
    let Some(observed) = observed else {
        return Step::create("cluster");
    };

    let mut changes = Vec::new();
    compare(
        &mut changes,
        "container_insights",
        observed.container_insights,
        desired.container_insights,
    );
    Step::update(changes)
}

fn diff_target_group(
    desired: &TargetGroupParams,
    observed: Option<&TargetGroupInfo>,
) -> Result<Option<Step>> {
    let Some(observed) = observed else {
        return Ok(Step::create("target group"));
    };

    let resource = format!("target-group {}", desired.name);
    if observed.port != desired.port {
        return Err(immutable(&resource, "port", observed.port, desired.port).into());
    }
    if observed.vpc_id != desired.vpc_id {
        return Err(immutable(&resource, "vpc_id", &observed.vpc_id, &desired.vpc_id).into());
    }

    let (o, d) = (&observed.health_check, &desired.health_check);
    let mut changes = Vec::new();
    compare(&mut changes, "health_check.path", &o.path, &d.path);
    compare(&mut changes, "health_check.interval_secs", o.interval_secs, d.interval_secs);
    compare(&mut changes, "health_check.timeout_secs", o.timeout_secs, d.timeout_secs);
    compare(
        &mut changes,
        "health_check.healthy_threshold",
        o.healthy_threshold,
        d.healthy_threshold,
    );
    compare(
        &mut changes,
        "health_check.unhealthy_threshold",
        o.unhealthy_threshold,
        d.unhealthy_threshold,
    );
    compare(&mut changes, "health_check.matcher", &o.matcher, &d.matcher);
    Ok(Step::update(changes))
}

fn diff_load_balancer(
    desired: &LoadBalancerParams,
    observed: Option<&LoadBalancerInfo>,
) -> Result<Option<Step>> {
    let Some(observed) = observed else {
        return Ok(Step::create("load balancer"));
    };

    if observed.scheme != desired.scheme.as_str() {
        return Err(immutable(
            &format!("load-balancer {}", desired.name),
            "scheme",
            &observed.scheme,
            desired.scheme,
        )
        .into());
    }

    let mut changes = Vec::new();
    compare_sets(&mut changes, "subnets", &observed.subnets, &desired.subnets);
    // without explicit groups the provider attaches the VPC default one
    if !desired.security_groups.is_empty() {
        compare_sets(
            &mut changes,
            "security_groups",
            &observed.security_groups,
            &desired.security_groups,
        );
    }
    Ok(Step::update(changes))
}

fn diff_listener(
    observed: Option<&ListenerInfo>,
    target_group: Option<&TargetGroupInfo>,
    target_group_created: bool,
) -> Option<Step> {
    let Some(listener) = observed else {
        return Step::create("listener");
    };

    let current = listener.target_group_arn.as_deref().unwrap_or("none");
    match target_group {
        _ if target_group_created => {
            Step::update(vec![change("target_group", current, "(new target group)")])
        }
        Some(tg) if listener.target_group_arn.as_deref() != Some(tg.arn.as_str()) => {
            Step::update(vec![change("target_group", current, &tg.arn)])
        }
        _ => None,
    }
}

fn diff_task_definition(
    desired: &TaskDefinitionParams,
    observed: Option<&TaskDefinitionInfo>,
) -> Option<Step> {
    let Some(observed) = observed else {
        return Step::create("task definition");
    };

    let o = &observed.params;
    let mut changes = Vec::new();
    compare(&mut changes, "cpu", o.cpu, desired.cpu);
    compare(&mut changes, "memory", o.memory, desired.memory);
    compare(
        &mut changes,
        "execution_role_arn",
        o.execution_role_arn.as_deref().unwrap_or("none"),
        desired.execution_role_arn.as_deref().unwrap_or("none"),
    );
    compare(
        &mut changes,
        "task_role_arn",
        o.task_role_arn.as_deref().unwrap_or("none"),
        desired.task_role_arn.as_deref().unwrap_or("none"),
    );

    let (oc, dc) = (&o.container, &desired.container);
    compare(&mut changes, "container.name", &oc.name, &dc.name);
    compare(&mut changes, "container.image", &oc.image, &dc.image);
    compare(&mut changes, "container.port", oc.port, dc.port);
    if oc.environment != dc.environment {
        let keys = |env: &std::collections::BTreeMap<String, String>| {
            env.keys().cloned().collect::<Vec<_>>().join(",")
        };
        changes.push(change(
            "container.environment",
            keys(&oc.environment),
            keys(&dc.environment),
        ));
    }
    compare(
        &mut changes,
        "container.command",
        oc.command.join(" "),
        dc.command.join(" "),
    );

    let mut step = Step::update(changes)?;
    step.reason = format!(
        "revision {} differs ({}); registering a new revision",
        observed.revision, step.reason
    );
    Some(step)
}

fn diff_service(
    desired: &ServiceParams,
    observed: &ObservedState,
    target_group_created: bool,
    task_definition_planned: bool,
) -> Result<Option<Step>> {
    let Some(service) = observed.service.as_ref() else {
        return Ok(Step::create("service"));
    };

    check_service_target_group(desired, service, observed.target_group.as_ref(), target_group_created)?;

    let mut changes = Vec::new();

    if task_definition_planned {
        changes.push(change(
            "task_definition",
            &service.task_definition_arn,
            "(new revision)",
        ));
    } else if let Some(td) = &observed.task_definition
        && service.task_definition_arn != td.arn
    {
        changes.push(change("task_definition", &service.task_definition_arn, &td.arn));
    }

    compare(&mut changes, "desired_count", service.desired_count, desired.desired_count);
    compare_sets(&mut changes, "subnets", &service.subnets, &desired.subnets);
    if !desired.security_groups.is_empty() {
        compare_sets(
            &mut changes,
            "security_groups",
            &service.security_groups,
            &desired.security_groups,
        );
    }
    compare(
        &mut changes,
        "assign_public_ip",
        service.assign_public_ip,
        desired.assign_public_ip,
    );
    if let Some(grace) = desired.health_check_grace_period_secs {
        compare(
            &mut changes,
            "health_check_grace_period_secs",
            service.health_check_grace_period_secs.unwrap_or_default(),
            grace,
        );
    }

    Ok(Step::update(changes))
}

/// A service's load balancer attachment is fixed at creation.
fn check_service_target_group(
    desired: &ServiceParams,
    service: &ServiceInfo,
    target_group: Option<&TargetGroupInfo>,
    target_group_created: bool,
) -> Result<()> {
    let attached = service.target_group_arns.first().map_or("none", String::as_str);
    let resource = format!("service {}", desired.name);

    match target_group {
        Some(tg) if !target_group_created && service.target_group_arns.contains(&tg.arn) => Ok(()),
        Some(tg) => Err(immutable(&resource, "target_group", attached, &tg.arn).into()),
        None => Err(immutable(&resource, "target_group", attached, "(new target group)").into()),
    }
}
