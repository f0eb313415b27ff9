//! Run driver.
//!
//! A run walks `Loading → Diffing → Applying → Converging` and ends in
//! `Succeeded`, `Failed` or `TimedOut`. An empty plan skips `Applying`.
//! The run holds the cluster's run lock from the end of validation until it
//! has recorded its outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::aws::{Bindings, CloudApi, ObservedState, StateObserver};
use crate::config::{DeploymentSpec, RolloutSpec, SpecHasher, SpecValidator};
use crate::error::{DeployError, Result};
use crate::planner::{ApplyEngine, ApplyReport, DiffEngine, Plan, PlanMode};
use crate::progress::{ProgressEvent, ProgressReporter, SilentProgress};
use crate::state::{DeploymentRecord, LockInfo, RunRecord, StateStore, generate_holder_id};
use crate::status::{ConvergenceOutcome, HttpProbe, StatusReporter};

/// How often a held lock is refreshed while waiting for convergence.
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Validating the descriptor and reading live state.
    Loading,
    /// Computing the plan.
    Diffing,
    /// Executing the plan.
    Applying,
    /// Waiting for the service to settle.
    Converging,
    /// Everything applied and the service converged.
    Succeeded,
    /// The run stopped on an error.
    Failed,
    /// The service did not converge before the deadline.
    TimedOut,
}

/// Command that started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Create or update everything.
    Deploy,
    /// Update an existing service.
    Update,
    /// Delete the service and its resources.
    Teardown,
}

/// Result of a run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Final phase.
    pub phase: RunPhase,
    /// What was recorded about the run.
    pub run: RunRecord,
    /// The plan, once computed.
    pub plan: Option<Plan>,
    /// Apply results, if the plan had operations.
    pub apply: Option<ApplyReport>,
    /// How the convergence wait ended, if it ran.
    pub convergence: Option<ConvergenceOutcome>,
    /// Identifiers known at the end of the run.
    pub bindings: Bindings,
    /// Why the run did not succeed.
    pub error: Option<DeployError>,
}

/// Drives deploy, update and teardown runs.
pub struct Reconciler {
    /// Control-plane client.
    api: Arc<dyn CloudApi>,
    /// Record and lock storage.
    store: Arc<dyn StateStore>,
    /// Progress sink.
    progress: Arc<dyn ProgressReporter>,
    /// Lock holder identifier.
    holder: String,
    /// Whether deploy and update wait for convergence.
    wait: bool,
    /// Endpoint probe used while converging.
    probe: Option<HttpProbe>,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Spec hasher.
    hasher: SpecHasher,
}

/// State carried through one run.
struct RunContext {
    target: String,
    record: RunRecord,
    plan: Option<Plan>,
    apply: Option<ApplyReport>,
    convergence: Option<ConvergenceOutcome>,
    bindings: Bindings,
}

impl RunPhase {
    /// Returns true for `Succeeded`, `Failed` and `TimedOut`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Process exit code for a run that ended in this phase.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::TimedOut => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Loading => "loading",
            Self::Diffing => "diffing",
            Self::Applying => "applying",
            Self::Converging => "converging",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        };
        write!(f, "{phase}")
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Deploy => "deploy",
            Self::Update => "update",
            Self::Teardown => "teardown",
        };
        write!(f, "{kind}")
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backend", &self.store.backend_type())
            .field("holder", &self.holder)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl RunOutcome {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.phase == RunPhase::Succeeded
    }

    /// Process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.phase.exit_code()
    }
}

impl Reconciler {
    /// Creates a reconciler that waits for convergence.
    #[must_use]
    pub fn new(api: Arc<dyn CloudApi>, store: Arc<dyn StateStore>) -> Self {
        Self {
            api,
            store,
            progress: Arc::new(SilentProgress),
            holder: generate_holder_id(),
            wait: true,
            probe: None,
            diff_engine: DiffEngine::new(),
            hasher: SpecHasher::new(),
        }
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Probes the load balancer endpoint while converging.
    #[must_use]
    pub fn with_probe(mut self, probe: HttpProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Controls whether deploy and update wait for convergence.
    #[must_use]
    pub const fn wait_for_convergence(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Computes the plan for a descriptor without applying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is invalid, live state cannot be
    /// read, or the plan cannot be built.
    pub async fn plan(&self, spec: &DeploymentSpec, mode: PlanMode) -> Result<(Plan, ObservedState)> {
        SpecValidator::new().validate(spec)?;
        let observed = StateObserver::new(self.api.clone()).observe(spec).await?;
        let plan = self.diff_engine.plan(spec, &observed, mode)?;
        Ok((plan, observed))
    }

    /// Computes the teardown plan for a deployed service.
    ///
    /// # Errors
    ///
    /// Returns an error if live state cannot be read.
    pub async fn teardown_plan(&self, cluster: &str, service: &str) -> Result<Plan> {
        let observed = StateObserver::new(self.api.clone()).discover(cluster, service).await?;
        Ok(Plan::teardown(&observed))
    }

    /// Creates or updates every resource, then waits for convergence.
    pub async fn deploy(&self, spec: &DeploymentSpec) -> RunOutcome {
        self.run(spec, RunKind::Deploy).await
    }

    /// As [`Self::deploy`], but fails when the service does not exist.
    pub async fn update(&self, spec: &DeploymentSpec) -> RunOutcome {
        self.run(spec, RunKind::Update).await
    }

    async fn run(&self, spec: &DeploymentSpec, kind: RunKind) -> RunOutcome {
        let spec_hash = self.hasher.hash_spec(spec);
        let mut ctx = RunContext::new(spec.qualified_name(), kind, &spec_hash);
        info!("Starting {kind} of {} ({})", ctx.target, SpecHasher::short_hash(&spec_hash));

        self.enter(&mut ctx, RunPhase::Loading);
        match SpecValidator::new().validate(spec) {
            Ok(findings) => {
                for warning in &findings.warnings {
                    warn!("{warning}");
                }
            }
            Err(e) => return self.finish(ctx, RunPhase::Failed, Some(e)),
        }

        let lock = match self.store.acquire_lock(&spec.cluster.name, &self.holder).await {
            Ok(lock) => lock,
            Err(e) => return self.finish(ctx, RunPhase::Failed, Some(e)),
        };

        let (phase, err, lock) = self.drive(&mut ctx, spec, kind, lock).await;
        let outcome_err = err.as_ref().map(ToString::to_string);
        ctx.record.finish(phase, outcome_err);
        self.record(&spec.cluster.name, &spec.service.name, &ctx, kind).await;
        self.release(&lock).await;

        self.finish(ctx, phase, err)
    }

    /// Runs the phases after the lock is held.
    async fn drive(
        &self,
        ctx: &mut RunContext,
        spec: &DeploymentSpec,
        kind: RunKind,
        lock: LockInfo,
    ) -> (RunPhase, Option<DeployError>, LockInfo) {
        let observed = match StateObserver::new(self.api.clone()).observe(spec).await {
            Ok(observed) => observed,
            Err(e) => return (RunPhase::Failed, Some(e), lock),
        };
        ctx.bindings = Bindings::from_observed(&observed);

        self.enter(ctx, RunPhase::Diffing);
        let mode = match kind {
            RunKind::Update => PlanMode::Update,
            RunKind::Deploy | RunKind::Teardown => PlanMode::Deploy,
        };
        let plan = match self.diff_engine.plan(spec, &observed, mode) {
            Ok(plan) => plan,
            Err(e) => return (RunPhase::Failed, Some(e), lock),
        };
        info!("Plan for {}: {}", ctx.target, plan.summary());

        if let Err(e) = self.apply(ctx, plan, &spec.rollout).await {
            return (RunPhase::Failed, Some(e), lock);
        }

        if !self.wait {
            return (RunPhase::Succeeded, None, lock);
        }

        self.enter(ctx, RunPhase::Converging);
        let reporter = self.status_reporter(spec, &ctx.bindings);
        let timeout = Duration::from_secs(spec.rollout.convergence.timeout_secs);
        let (result, lock) = self
            .holding(lock, reporter.wait(&spec.cluster.name, &spec.service.name, timeout))
            .await;

        match result {
            Ok(outcome) => {
                let phase = match outcome {
                    ConvergenceOutcome::Succeeded(_) => RunPhase::Succeeded,
                    ConvergenceOutcome::TimedOut { .. } => RunPhase::TimedOut,
                    ConvergenceOutcome::Degraded { .. } => RunPhase::Failed,
                };
                ctx.convergence = Some(outcome.clone());
                (phase, outcome.into_result().err(), lock)
            }
            Err(e) => (RunPhase::Failed, Some(e), lock),
        }
    }

    /// Deletes the service and the resources created for it.
    ///
    /// The cluster is deleted only when no other service remains in it.
    pub async fn teardown(&self, cluster: &str, service: &str) -> RunOutcome {
        let mut ctx = RunContext::new(format!("{cluster}/{service}"), RunKind::Teardown, "");
        info!("Starting teardown of {}", ctx.target);

        self.enter(&mut ctx, RunPhase::Loading);
        let lock = match self.store.acquire_lock(cluster, &self.holder).await {
            Ok(lock) => lock,
            Err(e) => return self.finish(ctx, RunPhase::Failed, Some(e)),
        };

        let result = self.drive_teardown(&mut ctx, cluster, service).await;
        let (phase, err) = match result {
            Ok(()) => (RunPhase::Succeeded, None),
            Err(e) => (RunPhase::Failed, Some(e)),
        };
        ctx.record.finish(phase, err.as_ref().map(ToString::to_string));
        self.record(cluster, service, &ctx, RunKind::Teardown).await;
        self.release(&lock).await;

        self.finish(ctx, phase, err)
    }

    async fn drive_teardown(&self, ctx: &mut RunContext, cluster: &str, service: &str) -> Result<()> {
        if let Some(record) = self.store.load(cluster, service).await?
            && let Some(hash) = record.spec_hash
        {
            ctx.record.spec_hash = hash;
        }

        let observed = StateObserver::new(self.api.clone()).discover(cluster, service).await?;
        ctx.bindings = Bindings::from_observed(&observed);

        self.enter(ctx, RunPhase::Diffing);
        let plan = Plan::teardown(&observed);
        info!("Teardown plan for {}: {}", ctx.target, plan.summary());

        // deletes run strictly in plan order
        let rollout = RolloutSpec {
            max_concurrency: 1,
            ..RolloutSpec::default()
        };
        self.apply(ctx, plan, &rollout).await?;
        ctx.bindings = Bindings::default();
        Ok(())
    }

    /// Executes a non-empty plan and keeps it on the context.
    async fn apply(&self, ctx: &mut RunContext, plan: Plan, rollout: &RolloutSpec) -> Result<()> {
        if plan.is_empty() {
            info!("{} is up to date", ctx.target);
            ctx.plan = Some(plan);
            return Ok(());
        }

        self.enter(ctx, RunPhase::Applying);
        let mut report = ApplyEngine::with_settings(self.api.clone(), rollout)
            .with_progress(self.progress.clone())
            .execute(&plan, ctx.bindings.clone())
            .await;

        ctx.record.applied = report.completed();
        ctx.record.not_applied = report.failed() + report.skipped();
        ctx.bindings.merge(report.bindings.clone());
        ctx.plan = Some(plan);

        let error = report.take_error();
        ctx.apply = Some(report);
        error.map_or(Ok(()), Err)
    }

    fn status_reporter(&self, spec: &DeploymentSpec, bindings: &Bindings) -> StatusReporter {
        let reporter = StatusReporter::new(self.api.clone(), &spec.rollout.convergence)
            .with_progress(self.progress.clone());

        match (&self.probe, &bindings.load_balancer_dns, spec.listener_port()) {
            (Some(probe), Some(dns), Some(port)) => {
                let url = HttpProbe::url_for(dns, port, &spec.target_group.health_check.path);
                reporter.with_probe(probe.clone(), url)
            }
            _ => reporter,
        }
    }

    /// Drives `work` to completion while refreshing the lock.
    async fn holding<T>(
        &self,
        mut lock: LockInfo,
        work: impl std::future::Future<Output = T>,
    ) -> (T, LockInfo) {
        tokio::pin!(work);
        let mut keepalive = tokio::time::interval(LOCK_REFRESH_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return (result, lock),
                _ = keepalive.tick() => match self.store.refresh_lock(&lock).await {
                    Ok(refreshed) => lock = refreshed,
                    Err(e) => warn!("Failed to refresh run lock for {}: {e}", lock.cluster),
                },
            }
        }
    }

    async fn record(&self, cluster: &str, service: &str, ctx: &RunContext, kind: RunKind) {
        let mut record = match self.store.load(cluster, service).await {
            Ok(Some(record)) => record,
            Ok(None) => DeploymentRecord::new(cluster, service),
            Err(e) => {
                warn!("Starting a fresh record for {cluster}/{service}: {e}");
                DeploymentRecord::new(cluster, service)
            }
        };

        if kind == RunKind::Teardown && ctx.record.phase == RunPhase::Succeeded {
            record.bindings = Bindings::default();
        } else {
            record.bindings.merge(ctx.bindings.clone());
        }
        record.record_run(ctx.record.clone());

        if let Err(e) = self.store.save(&record).await {
            warn!("Failed to record run for {cluster}/{service}: {e}");
        }
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(lock).await {
            warn!("Failed to release run lock for {}: {e}", lock.cluster);
        }
    }

    fn enter(&self, ctx: &mut RunContext, phase: RunPhase) {
        debug!("{}: {} -> {phase}", ctx.target, ctx.record.phase);
        ctx.record.phase = phase;
        self.progress.report(&ProgressEvent::Phase {
            target: ctx.target.clone(),
            phase,
            at: chrono::Utc::now(),
        });
    }

    fn finish(&self, mut ctx: RunContext, phase: RunPhase, error: Option<DeployError>) -> RunOutcome {
        match &error {
            Some(e) => error!("{} {phase}: {e}", ctx.target),
            None => info!("{} {phase}", ctx.target),
        }
        if !ctx.record.phase.is_terminal() {
            ctx.record.finish(phase, error.as_ref().map(ToString::to_string));
        }
        self.enter(&mut ctx, phase);

        RunOutcome {
            phase,
            run: ctx.record,
            plan: ctx.plan,
            apply: ctx.apply,
            convergence: ctx.convergence,
            bindings: ctx.bindings,
            error,
        }
    }
}

impl RunContext {
    fn new(target: String, kind: RunKind, spec_hash: &str) -> Self {
        Self {
            target,
            record: RunRecord::start(kind, spec_hash),
            plan: None,
            apply: None,
            convergence: None,
            bindings: Bindings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fake::{FakeCloud, test_spec};
    use crate::error::{ApplyError, ConfigError, ConvergenceError, PlanError, StateError};
    use crate::progress::testing::RecordingProgress;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    struct Harness {
        fake: Arc<FakeCloud>,
        store: Arc<LocalStateStore>,
        progress: Arc<RecordingProgress>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            Self {
                fake: Arc::new(FakeCloud::new()),
                store: Arc::new(LocalStateStore::with_base_dir(dir.path())),
                progress: Arc::new(RecordingProgress::default()),
                _dir: dir,
            }
        }

        fn reconciler(&self) -> Reconciler {
            Reconciler::new(self.fake.clone(), self.store.clone())
                .with_progress(self.progress.clone())
                .with_holder("test-run")
        }

        fn phases(&self) -> Vec<RunPhase> {
            self.progress
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    ProgressEvent::Phase { phase, .. } => Some(phase),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_walks_every_phase() {
        let h = Harness::new();
        let spec = test_spec();

        let outcome = h.reconciler().deploy(&spec).await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            h.phases(),
            vec![
                RunPhase::Loading,
                RunPhase::Diffing,
                RunPhase::Applying,
                RunPhase::Converging,
                RunPhase::Succeeded,
            ]
        );
        assert_eq!(outcome.apply.as_ref().map(ApplyReport::completed), Some(6));

        let record = h.store.load("lamp-cluster", "lamp").await.unwrap().unwrap();
        assert_eq!(record.spec_hash, Some(SpecHasher::new().hash_spec(&spec)));
        assert_eq!(record.last_phase, Some(RunPhase::Succeeded));
        assert!(record.bindings.service_arn.is_some());
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].applied, 6);
        assert!(h.store.lock_info("lamp-cluster").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeploy_skips_applying() {
        let h = Harness::new();
        let spec = test_spec();
        assert!(h.reconciler().deploy(&spec).await.is_success());
        h.fake.clear_calls();
        h.progress.events.lock().unwrap().clear();

        let outcome = h.reconciler().deploy(&spec).await;

        assert!(outcome.is_success());
        assert!(outcome.plan.as_ref().is_some_and(Plan::is_empty));
        assert!(outcome.apply.is_none());
        assert!(h.fake.calls().is_empty());
        assert_eq!(
            h.phases(),
            vec![
                RunPhase::Loading,
                RunPhase::Diffing,
                RunPhase::Converging,
                RunPhase::Succeeded,
            ]
        );

        let record = h.store.load("lamp-cluster", "lamp").await.unwrap().unwrap();
        assert_eq!(record.history.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_port_fails_without_calls() {
        let h = Harness::new();
        let mut spec = test_spec();
        spec.task.container.port = Some(70_000);

        let outcome = h.reconciler().deploy(&spec).await;

        assert_eq!(outcome.phase, RunPhase::Failed);
        assert_eq!(outcome.exit_code(), 1);
        match &outcome.error {
            Some(DeployError::Config(e @ ConfigError::ValidationError { .. })) => {
                assert_eq!(e.field(), Some("task.container.port"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(outcome.plan.is_none());
        assert!(h.fake.calls().is_empty());
        assert_eq!(h.phases(), vec![RunPhase::Loading, RunPhase::Failed]);
        assert!(h.store.load("lamp-cluster", "lamp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_cluster_is_refused() {
        let h = Harness::new();
        let held = h.store.acquire_lock("lamp-cluster", "other-run").await.unwrap();

        let outcome = h.reconciler().deploy(&test_spec()).await;

        match &outcome.error {
            Some(DeployError::State(StateError::LockedByOther { cluster, holder, .. })) => {
                assert_eq!(cluster, "lamp-cluster");
                assert_eq!(holder, "other-run");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(outcome.phase, RunPhase::Failed);
        assert!(h.fake.calls().is_empty());
        assert_eq!(h.store.lock_info("lamp-cluster").await.unwrap(), Some(held));
    }

    #[tokio::test(start_paused = true)]
    async fn test_convergence_timeout_exit_code() {
        let h = Harness::new();
        h.fake.script_running(&[1]);
        let started = tokio::time::Instant::now();

        let outcome = h.reconciler().deploy(&test_spec()).await;

        assert_eq!(outcome.phase, RunPhase::TimedOut);
        assert_eq!(outcome.exit_code(), 3);
        assert!(matches!(
            outcome.error,
            Some(DeployError::Convergence(ConvergenceError::Timeout { running: 1, desired: 2, .. }))
        ));
        assert!(matches!(outcome.convergence, Some(ConvergenceOutcome::TimedOut { .. })));
        assert!(started.elapsed() >= Duration::from_secs(60));

        let record = h.store.load("lamp-cluster", "lamp").await.unwrap().unwrap();
        assert_eq!(record.last_phase, Some(RunPhase::TimedOut));
        assert!(record.spec_hash.is_none());
    }

    #[tokio::test]
    async fn test_update_requires_deployed_service() {
        let h = Harness::new();

        let outcome = h.reconciler().update(&test_spec()).await;

        assert!(matches!(
            outcome.error,
            Some(DeployError::Plan(PlanError::NotDeployed { .. }))
        ));
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_apply_is_recorded() {
        let h = Harness::new();
        h.fake.fail_permanent("CreateListener");

        let outcome = h.reconciler().deploy(&test_spec()).await;

        assert_eq!(outcome.phase, RunPhase::Failed);
        assert!(matches!(
            outcome.error,
            Some(DeployError::Apply(ApplyError::OperationFailed { completed: 3, .. }))
        ));
        assert!(!h.phases().contains(&RunPhase::Converging));

        let record = h.store.load("lamp-cluster", "lamp").await.unwrap().unwrap();
        let run = record.last_run().unwrap();
        assert_eq!(run.phase, RunPhase::Failed);
        assert_eq!(run.applied, 3);
        assert!(run.error.as_deref().is_some_and(|e| e.contains("create listener")));
        assert!(record.bindings.load_balancer_arn.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_without_waiting() {
        let h = Harness::new();
        h.fake.script_running(&[0]);

        let outcome = h.reconciler().wait_for_convergence(false).deploy(&test_spec()).await;

        assert!(outcome.is_success());
        assert!(outcome.convergence.is_none());
        assert!(!h.phases().contains(&RunPhase::Converging));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_deploy() {
        let h = Harness::new();
        assert!(h.reconciler().deploy(&test_spec()).await.is_success());
        h.fake.clear_calls();

        let preview = h.reconciler().teardown_plan("lamp-cluster", "lamp").await.unwrap();
        assert_eq!(preview.len(), 6);

        let outcome = h.reconciler().teardown("lamp-cluster", "lamp").await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        let calls = h.fake.calls();
        assert_eq!(calls.first().map(String::as_str), Some("DeleteService lamp"));
        assert_eq!(calls.last().map(String::as_str), Some("DeleteCluster lamp-cluster"));

        let record = h.store.load("lamp-cluster", "lamp").await.unwrap().unwrap();
        assert!(record.spec_hash.is_none());
        assert_eq!(record.bindings, Bindings::default());
        assert_eq!(record.last_run().map(|r| r.kind), Some(RunKind::Teardown));

        let again = h.reconciler().teardown("lamp-cluster", "lamp").await;
        assert!(again.is_success());
        assert!(again.apply.is_none());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunPhase::Succeeded.exit_code(), 0);
        assert_eq!(RunPhase::Failed.exit_code(), 1);
        assert_eq!(RunPhase::TimedOut.exit_code(), 3);
        assert!(!RunPhase::Converging.is_terminal());
    }
}
