//! Plan executor.
//!
//! Operations start as soon as every operation they depend on has
//! completed, with at most `max_concurrency` in flight. With a concurrency
//! of one the plan runs strictly in order. A permanent failure blocks the
//! failing operation's dependants; unless `continue_on_error` is set it also
//! stops new operations from starting, while in-flight ones are allowed to
//! finish.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aws::{Bindings, CloudApi};
use crate::config::RolloutSpec;
use crate::error::{ApplyError, DeployError, Result};
use crate::progress::{OperationStatus, ProgressEvent, ProgressReporter, SilentProgress};

use super::plan::{Operation, OperationKind, Plan, ResourceKind, ResourceParams};
use super::retry::RetryPolicy;

/// Executor for plans.
pub struct ApplyEngine {
    /// Control-plane client.
    api: Arc<dyn CloudApi>,
    /// Retry policy for each operation.
    retry: RetryPolicy,
    /// Maximum operations in flight.
    max_concurrency: usize,
    /// Whether to keep starting independent operations after a failure.
    continue_on_error: bool,
    /// Progress sink.
    progress: Arc<dyn ProgressReporter>,
}

/// Final state of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Applied.
    Succeeded,
    /// Failed permanently.
    Failed(String),
    /// Never started.
    Skipped(String),
}

/// Result of one operation.
#[derive(Debug, Clone)]
pub struct OperationReport {
    /// Plan index.
    pub index: usize,
    /// Operation description.
    pub description: String,
    /// Outcome.
    pub outcome: OperationOutcome,
}

/// Result of executing a plan.
#[derive(Debug)]
pub struct ApplyReport {
    /// Per-operation results, in plan order.
    pub operations: Vec<OperationReport>,
    /// Identifiers known after the run.
    pub bindings: Bindings,
    /// The first permanent failure.
    first_failure: Option<(String, DeployError)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Done,
    Failed(String),
    Skipped(String),
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("retry", &self.retry)
            .field("max_concurrency", &self.max_concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .finish_non_exhaustive()
    }
}

impl ApplyEngine {
    /// Creates an engine with default rollout settings.
    #[must_use]
    pub fn new(api: Arc<dyn CloudApi>) -> Self {
        Self::with_settings(api, &RolloutSpec::default())
    }

    /// Creates an engine from rollout settings.
    #[must_use]
    pub fn with_settings(api: Arc<dyn CloudApi>, rollout: &RolloutSpec) -> Self {
        Self {
            api,
            retry: RetryPolicy::from(&rollout.retry),
            max_concurrency: usize::try_from(rollout.max_concurrency.max(1)).unwrap_or(1),
            continue_on_error: rollout.continue_on_error,
            progress: Arc::new(SilentProgress),
        }
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Executes a plan.
    ///
    /// `bindings` carries identifiers of resources that already exist;
    /// operations add the ones they produce.
    pub async fn execute(&self, plan: &Plan, bindings: Bindings) -> ApplyReport {
        info!("Applying plan with {} operations", plan.len());

        let ops = &plan.operations;
        let mut slots = vec![Slot::Pending; ops.len()];
        let mut bindings = bindings;
        let mut first_failure: Option<(String, DeployError)> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            block_dependants(ops, &mut slots);

            let halted = first_failure.is_some() && !self.continue_on_error;
            if !halted {
                for op in ops {
                    if in_flight.len() >= self.max_concurrency {
                        break;
                    }
                    if slots[op.index] != Slot::Pending
                        || !op.depends_on.iter().all(|&d| slots[d] == Slot::Done)
                    {
                        continue;
                    }

                    slots[op.index] = Slot::Running;
                    self.emit(op, OperationStatus::Started, None);
                    let snapshot = bindings.clone();
                    in_flight.push(async move { (op.index, self.run_operation(op, snapshot).await) });
                }
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };
            let op = &ops[index];

            match result {
                Ok(produced) => {
                    debug!("{op} completed");
                    bindings.merge(produced);
                    slots[index] = Slot::Done;
                    self.emit(op, OperationStatus::Succeeded, None);
                }
                Err(e) => {
                    error!("{op} failed: {e}");
                    let message = e.to_string();
                    slots[index] = Slot::Failed(message.clone());
                    self.emit(op, OperationStatus::Failed, Some(message));
                    if first_failure.is_none() {
                        first_failure = Some((op.description(), e));
                    }
                }
            }
        }

        // anything still pending was never started
        if let Some(failed) = slots.iter().position(|s| matches!(s, Slot::Failed(_))) {
            for (index, slot) in slots.iter_mut().enumerate() {
                if *slot == Slot::Pending {
                    let reason = format!("aborted after #{failed} failed");
                    warn!("Skipping #{index}: {reason}");
                    self.emit(&ops[index], OperationStatus::Skipped, Some(reason.clone()));
                    *slot = Slot::Skipped(reason);
                }
            }
        }

        let operations = ops
            .iter()
            .zip(slots)
            .map(|(op, slot)| OperationReport {
                index: op.index,
                description: op.description(),
                outcome: match slot {
                    Slot::Done => OperationOutcome::Succeeded,
                    Slot::Failed(e) => OperationOutcome::Failed(e),
                    Slot::Skipped(r) => OperationOutcome::Skipped(r),
                    Slot::Pending | Slot::Running => {
                        OperationOutcome::Skipped(String::from("not started"))
                    }
                },
            })
            .collect();

        let report = ApplyReport {
            operations,
            bindings,
            first_failure,
        };
        info!("{report}");
        report
    }

    /// Runs one operation with retries.
    async fn run_operation(&self, op: &Operation, bindings: Bindings) -> Result<Bindings> {
        let description = op.description();
        self.retry
            .run(&description, || self.apply_once(op, &bindings))
            .await
    }

    /// Makes the API call for one operation attempt.
    async fn apply_once(&self, op: &Operation, bindings: &Bindings) -> Result<Bindings> {
        let api = &self.api;

        match (&op.params, op.kind) {
            (ResourceParams::Cluster(params), OperationKind::Create) => {
                let cluster = api.create_cluster(params).await?;
                Ok(Bindings {
                    cluster_arn: Some(cluster.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::Cluster(params), OperationKind::Update) => {
                let cluster = api.update_cluster(params).await?;
                Ok(Bindings {
                    cluster_arn: Some(cluster.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::TargetGroup(params), OperationKind::Create) => {
                let group = api.create_target_group(params).await?;
                Ok(Bindings {
                    target_group_arn: Some(group.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::TargetGroup(params), OperationKind::Update) => {
                let arn = require(op, bindings.target_group_arn.as_deref(), "target group ARN")?;
                api.modify_target_group(arn, params).await?;
                Ok(Bindings::default())
            }
            (ResourceParams::LoadBalancer(params), OperationKind::Create) => {
                let lb = api.create_load_balancer(params).await?;
                Ok(Bindings {
                    load_balancer_arn: Some(lb.arn),
                    load_balancer_dns: Some(lb.dns_name),
                    ..Bindings::default()
                })
            }
            (ResourceParams::LoadBalancer(params), OperationKind::Update) => {
                let arn = require(op, bindings.load_balancer_arn.as_deref(), "load balancer ARN")?;
                api.update_load_balancer(arn, params).await?;
                Ok(Bindings::default())
            }
            (ResourceParams::Listener(params), OperationKind::Create) => {
                let lb = require(op, bindings.load_balancer_arn.as_deref(), "load balancer ARN")?;
                let tg = require(op, bindings.target_group_arn.as_deref(), "target group ARN")?;
                let listener = api.create_listener(lb, params.port, tg).await?;
                Ok(Bindings {
                    listener_arn: Some(listener.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::Listener(_), OperationKind::Update) => {
                let listener = require(op, bindings.listener_arn.as_deref(), "listener ARN")?;
                let tg = require(op, bindings.target_group_arn.as_deref(), "target group ARN")?;
                api.update_listener(listener, tg).await?;
                Ok(Bindings::default())
            }
            (ResourceParams::TaskDefinition(params), OperationKind::Create | OperationKind::Update) => {
                let td = api.register_task_definition(params).await?;
                info!("Registered {} revision {}", params.family, td.revision);
                Ok(Bindings {
                    task_definition_arn: Some(td.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::Service(params), OperationKind::Create) => {
                let td = require(op, bindings.task_definition_arn.as_deref(), "task definition ARN")?;
                let tg = require(op, bindings.target_group_arn.as_deref(), "target group ARN")?;
                let service = api.create_service(params, td, tg).await?;
                Ok(Bindings {
                    service_arn: Some(service.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::Service(params), OperationKind::Update) => {
                let td = require(op, bindings.task_definition_arn.as_deref(), "task definition ARN")?;
                let service = api.update_service(params, td).await?;
                Ok(Bindings {
                    service_arn: Some(service.arn),
                    ..Bindings::default()
                })
            }
            (ResourceParams::Existing(target), OperationKind::Delete) => {
                match op.resource {
                    ResourceKind::Service => {
                        let cluster = target.cluster.as_deref().unwrap_or_default();
                        api.delete_service(cluster, &target.name).await?;
                    }
                    ResourceKind::Listener => api.delete_listener(&target.arn).await?,
                    ResourceKind::LoadBalancer => api.delete_load_balancer(&target.arn).await?,
                    ResourceKind::TargetGroup => api.delete_target_group(&target.arn).await?,
                    ResourceKind::TaskDefinition => {
                        api.deregister_task_definition(&target.arn).await?;
                    }
                    ResourceKind::Cluster => api.delete_cluster(&target.name).await?,
                }
                Ok(Bindings::default())
            }
            _ => Err(DeployError::internal(format!(
                "{op}: unsupported {} of {}",
                op.kind, op.resource
            ))),
        }
    }

    fn emit(&self, op: &Operation, status: OperationStatus, detail: Option<String>) {
        self.progress.report(&ProgressEvent::Operation {
            index: op.index,
            description: op.description(),
            status,
            detail,
        });
    }
}

/// Marks every pending operation with a failed or skipped dependency.
fn block_dependants(ops: &[Operation], slots: &mut [Slot]) {
    // dependencies point backwards, so one forward pass is transitive
    for op in ops {
        if slots[op.index] != Slot::Pending {
            continue;
        }
        let blocker = op
            .depends_on
            .iter()
            .copied()
            .find(|&d| matches!(slots[d], Slot::Failed(_) | Slot::Skipped(_)));
        if let Some(blocker) = blocker {
            let reason = format!("blocked by #{blocker}");
            debug!("Skipping {op}: {reason}");
            slots[op.index] = Slot::Skipped(reason);
        }
    }
}

fn require<'a>(op: &Operation, value: Option<&'a str>, binding: &'static str) -> Result<&'a str> {
    value.ok_or_else(|| {
        ApplyError::MissingBinding {
            operation: op.description(),
            binding,
        }
        .into()
    })
}

impl ApplyReport {
    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    /// Number of operations that succeeded.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Succeeded))
    }

    /// Number of operations that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Failed(_)))
    }

    /// Number of operations that never started.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Skipped(_)))
    }

    fn count(&self, f: impl Fn(&OperationOutcome) -> bool) -> usize {
        self.operations.iter().filter(|o| f(&o.outcome)).count()
    }

    /// Takes the first failure out of the report.
    ///
    /// A cloud error is wrapped in `ApplyError::OperationFailed` together
    /// with the completed and skipped counts; any other error is returned
    /// as-is.
    pub fn take_error(&mut self) -> Option<DeployError> {
        let (completed, skipped) = (self.completed(), self.skipped());
        match self.first_failure.take()? {
            (operation, DeployError::Cloud(source)) => Some(
                ApplyError::OperationFailed {
                    operation,
                    source,
                    completed,
                    skipped,
                }
                .into(),
            ),
            (_, other) => Some(other),
        }
    }

    /// Converts the report into the bindings, or the first failure.
    ///
    /// # Errors
    ///
    /// Returns the error [`Self::take_error`] yields.
    pub fn into_result(mut self) -> Result<Bindings> {
        match self.take_error() {
            None => Ok(self.bindings),
            Some(e) => Err(e),
        }
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied {} operations: {} completed, {} failed, {} skipped",
            self.operations.len(),
            self.completed(),
            self.failed(),
            self.skipped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fake::{FakeCloud, test_spec};
    use crate::aws::{ObservedState, StateObserver};
    use crate::error::CloudError;
    use crate::planner::{DiffEngine, PlanMode};

    fn fresh_plan() -> Plan {
        DiffEngine::new()
            .plan(&test_spec(), &ObservedState::default(), PlanMode::Deploy)
            .unwrap()
    }

    fn engine(fake: &Arc<FakeCloud>, rollout: &RolloutSpec) -> ApplyEngine {
        ApplyEngine::with_settings(fake.clone(), rollout)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_apply_then_replan_is_empty() {
        let fake = Arc::new(FakeCloud::new());
        let spec = test_spec();

        let report = engine(&fake, &spec.rollout)
            .execute(&fresh_plan(), Bindings::default())
            .await;
        assert!(report.is_success(), "{report}");
        assert_eq!(report.completed(), 6);
        assert_eq!(
            fake.calls(),
            vec![
                "CreateCluster lamp-cluster",
                "CreateTargetGroup lamp-tg",
                "CreateLoadBalancer lamp-alb",
                "CreateListener 80",
                "RegisterTaskDefinition lamp-task",
                "CreateService lamp",
            ]
        );

        let bindings = report.into_result().unwrap();
        assert!(bindings.service_arn.is_some());
        assert!(bindings.load_balancer_dns.is_some());

        let observed = StateObserver::new(fake.clone()).observe(&spec).await.unwrap();
        let replan = DiffEngine::new().plan(&spec, &observed, PlanMode::Deploy).unwrap();
        assert!(replan.is_empty(), "{replan}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_change_applies_in_place() {
        let fake = Arc::new(FakeCloud::new());
        let spec = test_spec();
        fake.provision(&spec).await;

        let mut changed = spec.clone();
        changed.target_group.health_check.path = String::from("/healthz");

        let observer = StateObserver::new(fake.clone());
        let observed = observer.observe(&changed).await.unwrap();
        let plan = DiffEngine::new().plan(&changed, &observed, PlanMode::Deploy).unwrap();
        assert_eq!(plan.len(), 1);

        let report = engine(&fake, &changed.rollout)
            .execute(&plan, Bindings::from_observed(&observed))
            .await;
        assert!(report.is_success(), "{report}");
        assert_eq!(fake.calls(), vec!["ModifyTargetGroup lamp-tg"]);

        let observed = observer.observe(&changed).await.unwrap();
        let replan = DiffEngine::new().plan(&changed, &observed, PlanMode::Deploy).unwrap();
        assert!(replan.is_empty(), "{replan}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let fake = Arc::new(FakeCloud::new());
        fake.fail_transient("CreateLoadBalancer", 2);

        let report = engine(&fake, &test_spec().rollout)
            .execute(&fresh_plan(), Bindings::default())
            .await;

        assert!(report.is_success());
        assert_eq!(fake.attempts("CreateLoadBalancer"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_transient_failure_on_fourth_operation() {
        let fake = Arc::new(FakeCloud::new());
        let spec = test_spec();
        fake.fail_always("CreateListener");

        let started = tokio::time::Instant::now();
        let report = engine(&fake, &spec.rollout)
            .execute(&fresh_plan(), Bindings::default())
            .await;

        // operations 0..=2 applied, #3 retried to the bound, nothing after it
        assert_eq!(fake.calls().len(), 3);
        assert_eq!(fake.attempts("CreateListener"), spec.rollout.retry.max_attempts);
        assert_eq!(fake.attempts("RegisterTaskDefinition"), 0);
        assert_eq!(report.completed(), 3);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(
            report.operations[5].outcome,
            OperationOutcome::Skipped(String::from("blocked by #3"))
        );
        assert_eq!(
            report.operations[4].outcome,
            OperationOutcome::Skipped(String::from("aborted after #3 failed"))
        );
        // 100ms + 200ms of backoff between three attempts
        assert_eq!(started.elapsed(), std::time::Duration::from_millis(300));

        match report.into_result() {
            Err(DeployError::Apply(ApplyError::OperationFailed {
                source: CloudError::RetriesExhausted { attempts, .. },
                completed: 3,
                skipped: 2,
                ..
            })) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_on_error_runs_independent_chains() {
        let fake = Arc::new(FakeCloud::new());
        let mut rollout = test_spec().rollout;
        rollout.continue_on_error = true;
        fake.fail_permanent("CreateTargetGroup");

        let report = engine(&fake, &rollout)
            .execute(&fresh_plan(), Bindings::default())
            .await;

        // target group fails; listener and service are blocked; the rest run
        assert_eq!(report.failed(), 1);
        assert_eq!(report.completed(), 3);
        assert_eq!(report.skipped(), 2);
        assert_eq!(fake.attempts("CreateTargetGroup"), 1);
        assert_eq!(fake.attempts("RegisterTaskDefinition"), 1);
        assert_eq!(fake.attempts("CreateListener"), 0);
        assert_eq!(fake.attempts("CreateService"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_apply() {
        let fake = Arc::new(FakeCloud::new());
        let mut rollout = test_spec().rollout;
        rollout.max_concurrency = 4;

        let report = engine(&fake, &rollout)
            .execute(&fresh_plan(), Bindings::default())
            .await;

        assert!(report.is_success());
        let calls = fake.calls();
        let position = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(position("CreateListener") > position("CreateLoadBalancer"));
        assert!(position("CreateListener") > position("CreateTargetGroup"));
        assert!(position("CreateService") > position("CreateListener"));
        assert!(position("CreateService") > position("RegisterTaskDefinition"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_apply() {
        let fake = Arc::new(FakeCloud::new());
        fake.provision(&test_spec()).await;
        let observed = StateObserver::new(fake.clone())
            .discover("lamp-cluster", "lamp")
            .await
            .unwrap();

        let report = engine(&fake, &test_spec().rollout)
            .execute(&Plan::teardown(&observed), Bindings::default())
            .await;

        assert!(report.is_success(), "{report}");
        assert_eq!(fake.calls()[0], "DeleteService lamp");
        assert_eq!(fake.calls().last().map(String::as_str), Some("DeleteCluster lamp-cluster"));
        assert_eq!(fake.active_revisions("lamp-task"), 0);

        let after = StateObserver::new(fake).discover("lamp-cluster", "lamp").await.unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binding_fails_operation() {
        let fake = Arc::new(FakeCloud::new());
        let spec = test_spec();
        let plan = fresh_plan();
        // run only the listener, with nothing bound
        let listener_only = Plan::new(
            plan.spec_hash.clone(),
            vec![Operation {
                depends_on: Vec::new(),
                ..plan.operations[3].clone()
            }],
        )
        .unwrap();

        let report = engine(&fake, &spec.rollout)
            .execute(&listener_only, Bindings::default())
            .await;

        assert!(matches!(
            report.into_result(),
            Err(DeployError::Apply(ApplyError::MissingBinding { .. }))
        ));
    }
}
