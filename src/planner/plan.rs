//! Deployment plan types.
//!
//! A plan is an ordered list of operations. Each operation names the
//! resource it touches, carries the desired parameters, and lists the
//! earlier operations it depends on. Identifiers such as ARNs are not in the
//! plan; they are bound while it executes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::aws::{
    ClusterParams, ListenerParams, LoadBalancerParams, ObservedState, ServiceParams,
    TargetGroupParams, TaskDefinitionParams,
};
use crate::error::{PlanError, Result};

/// Kinds of resource the orchestrator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// ECS cluster.
    Cluster,
    /// Load balancer target group.
    TargetGroup,
    /// Application load balancer.
    LoadBalancer,
    /// Load balancer listener.
    Listener,
    /// Task definition revision.
    TaskDefinition,
    /// ECS service.
    Service,
}

/// What an operation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create the resource.
    Create,
    /// Update the resource in place.
    Update,
    /// Delete the resource.
    Delete,
}

/// Reference to an existing resource, used by deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    /// Resource name.
    pub name: String,
    /// Resource ARN.
    pub arn: String,
    /// Owning cluster, for services.
    pub cluster: Option<String>,
}

/// Parameters an operation applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResourceParams {
    /// Cluster parameters.
    Cluster(ClusterParams),
    /// Target group parameters.
    TargetGroup(TargetGroupParams),
    /// Load balancer parameters.
    LoadBalancer(LoadBalancerParams),
    /// Listener parameters.
    Listener(ListenerParams),
    /// Task definition parameters.
    TaskDefinition(TaskDefinitionParams),
    /// Service parameters.
    Service(ServiceParams),
    /// An existing resource.
    Existing(ResourceRef),
}

/// A single field that differs between observed and desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Observed value.
    pub observed: String,
    /// Desired value.
    pub desired: String,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    /// Position in the plan.
    pub index: usize,
    /// Resource kind.
    pub resource: ResourceKind,
    /// Operation kind.
    pub kind: OperationKind,
    /// Resource name, for display.
    pub name: String,
    /// Parameters to apply.
    pub params: ResourceParams,
    /// Differing fields, for updates.
    pub changes: Vec<FieldChange>,
    /// Why the operation is needed.
    pub reason: String,
    /// Indices of operations that must complete first.
    pub depends_on: Vec<usize>,
}

/// An ordered set of operations.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
    /// Hash of the descriptor the plan was built from.
    pub spec_hash: String,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
}

/// Operation counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub creates: usize,
    /// Updates.
    pub updates: usize,
    /// Deletes.
    pub deletes: usize,
}

impl ResourceKind {
    /// Tie-break rank when ordering independent operations.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Cluster => 0,
            Self::TargetGroup => 1,
            Self::LoadBalancer => 2,
            Self::Listener => 3,
            Self::TaskDefinition => 4,
            Self::Service => 5,
        }
    }
}

impl Operation {
    /// Returns a one-line description, e.g. `create listener lamp-alb:80`.
    #[must_use]
    pub fn description(&self) -> String {
        let verb = match (self.kind, self.resource) {
            (OperationKind::Create | OperationKind::Update, ResourceKind::TaskDefinition) => {
                "register"
            }
            (OperationKind::Delete, ResourceKind::TaskDefinition) => "deregister",
            (OperationKind::Create, _) => "create",
            (OperationKind::Update, _) => "update",
            (OperationKind::Delete, _) => "delete",
        };
        format!("{verb} {} {}", self.resource, self.name)
    }
}

impl Plan {
    /// Builds a plan and checks that dependencies point backwards.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::InvalidDependency` if an operation depends on
    /// itself or on a later one.
    pub fn new(spec_hash: impl Into<String>, mut operations: Vec<Operation>) -> Result<Self> {
        for (index, op) in operations.iter_mut().enumerate() {
            op.index = index;
        }

        let plan = Self {
            created_at: Utc::now(),
            spec_hash: spec_hash.into(),
            operations,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Checks that every dependency precedes its dependant.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::InvalidDependency` on the first violation.
    pub fn validate(&self) -> Result<()> {
        for op in &self.operations {
            if let Some(&dependency) = op.depends_on.iter().find(|&&d| d >= op.index) {
                return Err(PlanError::InvalidDependency {
                    index: op.index,
                    dependency,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Builds the explicit teardown plan for a discovered service.
    ///
    /// Deletes run service, listener, load balancer, target group; the
    /// task definition revision is deregistered after the service. The
    /// cluster is deleted last, and only when no other service remains in it.
    #[must_use]
    pub fn teardown(observed: &ObservedState) -> Self {
        let mut ops: Vec<Operation> = Vec::new();

        let service = observed.service.as_ref().map(|svc| {
            push_delete(
                &mut ops,
                ResourceKind::Service,
                ResourceRef {
                    name: svc.name.clone(),
                    arn: svc.arn.clone(),
                    cluster: Some(svc.cluster.clone()),
                },
                Vec::new(),
            )
        });

        let listener = observed.listener.as_ref().map(|listener| {
            push_delete(
                &mut ops,
                ResourceKind::Listener,
                ResourceRef {
                    name: format!("port {}", listener.port),
                    arn: listener.arn.clone(),
                    cluster: None,
                },
                service.into_iter().collect(),
            )
        });

        if let Some(lb) = &observed.load_balancer {
            push_delete(
                &mut ops,
                ResourceKind::LoadBalancer,
                ResourceRef {
                    name: lb.name.clone(),
                    arn: lb.arn.clone(),
                    cluster: None,
                },
                listener.or(service).into_iter().collect(),
            );
        }

        if let Some(tg) = &observed.target_group {
            // a target group cannot be deleted while a listener forwards to it
            let depends_on = service.into_iter().chain(listener).collect();
            push_delete(
                &mut ops,
                ResourceKind::TargetGroup,
                ResourceRef {
                    name: tg.name.clone(),
                    arn: tg.arn.clone(),
                    cluster: None,
                },
                depends_on,
            );
        }

        if let Some(td) = &observed.task_definition {
            push_delete(
                &mut ops,
                ResourceKind::TaskDefinition,
                ResourceRef {
                    name: format!("{}:{}", td.params.family, td.revision),
                    arn: td.arn.clone(),
                    cluster: None,
                },
                service.into_iter().collect(),
            );
        }

        if let Some(cluster) = &observed.cluster {
            let remaining = cluster
                .active_services
                .saturating_sub(u32::from(observed.service.is_some()));
            if remaining == 0 {
                push_delete(
                    &mut ops,
                    ResourceKind::Cluster,
                    ResourceRef {
                        name: cluster.name.clone(),
                        arn: cluster.arn.clone(),
                        cluster: None,
                    },
                    service.into_iter().collect(),
                );
            }
        }

        Self {
            created_at: Utc::now(),
            spec_hash: String::new(),
            operations: ops,
        }
    }

    /// Returns true if there is nothing to do.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.operations.len()
    }

    /// Counts operations by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        self.operations
            .iter()
            .fold(PlanSummary::default(), |mut summary, op| {
                match op.kind {
                    OperationKind::Create => summary.creates += 1,
                    OperationKind::Update => summary.updates += 1,
                    OperationKind::Delete => summary.deletes += 1,
                }
                summary
            })
    }

    /// Returns the operation touching `resource`, if any.
    #[must_use]
    pub fn find(&self, resource: ResourceKind) -> Option<&Operation> {
        self.operations.iter().find(|op| op.resource == resource)
    }

    /// Returns the indices of operations that depend on `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        self.operations
            .iter()
            .filter(|op| op.depends_on.contains(&index))
            .map(|op| op.index)
            .collect()
    }
}

fn push_delete(
    ops: &mut Vec<Operation>,
    resource: ResourceKind,
    reference: ResourceRef,
    depends_on: Vec<usize>,
) -> usize {
    let index = ops.len();
    ops.push(Operation {
        index,
        resource,
        kind: OperationKind::Delete,
        name: reference.name.clone(),
        params: ResourceParams::Existing(reference),
        changes: Vec::new(),
        reason: String::from("teardown requested"),
        depends_on,
    });
    index
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cluster => "cluster",
            Self::TargetGroup => "target-group",
            Self::LoadBalancer => "load-balancer",
            Self::Listener => "listener",
            Self::TaskDefinition => "task-definition",
            Self::Service => "service",
        };
        f.write_str(s)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.description())
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete",
            self.creates, self.updates, self.deletes
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operations.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({}):", self.summary())?;
        for op in &self.operations {
            write!(f, "  {op}")?;
            if !op.depends_on.is_empty() {
                let deps: Vec<String> = op.depends_on.iter().map(|d| format!("#{d}")).collect();
                write!(f, " (after {})", deps.join(", "))?;
            }
            writeln!(f)?;
            for change in &op.changes {
                writeln!(
                    f,
                    "      {}: {} -> {}",
                    change.field, change.observed, change.desired
                )?;
            }
        }
        Ok(())
    }
}
