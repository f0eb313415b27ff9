//! Convergence polling.
//!
//! A service is converged when every desired task runs, nothing is pending,
//! no task reports unhealthy, the primary deployment has finished rolling
//! out, and the target group routes to at least as many healthy targets as
//! tasks are desired.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aws::{CloudApi, RolloutState, ServiceInfo, TaskHealth};
use crate::config::ConvergenceSpec;
use crate::error::{CloudError, ConvergenceError, Result};
use crate::progress::{ProgressEvent, ProgressReporter, SilentProgress};

use super::probe::{HttpProbe, ProbeResult};

/// Point-in-time view of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    /// Cluster name.
    pub cluster: String,
    /// Service name.
    pub service: String,
    /// Service status.
    pub status: String,
    /// Desired task count.
    pub desired: u32,
    /// Running task count.
    pub running: u32,
    /// Pending task count.
    pub pending: u32,
    /// Healthy load balancer targets.
    pub healthy_targets: u32,
    /// Running tasks whose health check fails.
    pub unhealthy_tasks: u32,
    /// Primary deployment rollout state.
    pub rollout: Option<RolloutState>,
    /// Number of deployments.
    pub deployments: u32,
    /// Task definition revision in use.
    pub task_definition_arn: String,
    /// HTTP probe result, if a probe is configured.
    pub probe: Option<ProbeResult>,
    /// When the snapshot was taken.
    pub observed_at: DateTime<Utc>,
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    /// The service converged.
    Succeeded(ServiceSnapshot),
    /// The deadline passed first.
    TimedOut {
        /// Last snapshot before the deadline.
        snapshot: ServiceSnapshot,
        /// The deadline that passed.
        timeout: Duration,
    },
    /// The rollout failed or the service kept losing tasks.
    Degraded {
        /// Snapshot that triggered the verdict.
        snapshot: ServiceSnapshot,
        /// Why.
        reason: String,
    },
}

/// Polls a service until it converges.
pub struct StatusReporter {
    /// Control-plane client.
    api: Arc<dyn CloudApi>,
    /// Time between polls.
    interval: Duration,
    /// Drops below desired before the service counts as degraded.
    flap_threshold: u32,
    /// Optional endpoint probe.
    probe: Option<(HttpProbe, String)>,
    /// Progress sink.
    progress: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("interval", &self.interval)
            .field("flap_threshold", &self.flap_threshold)
            .field("probe", &self.probe.as_ref().map(|(_, url)| url))
            .finish_non_exhaustive()
    }
}

impl ServiceSnapshot {
    /// Returns true if the service has converged.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.running == self.desired
            && self.pending == 0
            && self.unhealthy_tasks == 0
            && !matches!(
                self.rollout,
                Some(RolloutState::InProgress | RolloutState::Failed)
            )
            && self.healthy_targets >= self.desired
    }

    /// Placeholder for a service no poll managed to describe.
    fn unobserved(cluster: &str, service: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            service: service.to_string(),
            status: String::from("UNKNOWN"),
            desired: 0,
            running: 0,
            pending: 0,
            healthy_targets: 0,
            unhealthy_tasks: 0,
            rollout: None,
            deployments: 0,
            task_definition_arn: String::new(),
            probe: None,
            observed_at: Utc::now(),
        }
    }
}

impl StatusReporter {
    /// Creates a reporter from convergence settings.
    #[must_use]
    pub fn new(api: Arc<dyn CloudApi>, settings: &ConvergenceSpec) -> Self {
        Self {
            api,
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            flap_threshold: settings.flap_threshold.max(1),
            probe: None,
            progress: Arc::new(SilentProgress),
        }
    }

    /// Probes `url` with every snapshot.
    #[must_use]
    pub fn with_probe(mut self, probe: HttpProbe, url: impl Into<String>) -> Self {
        self.probe = Some((probe, url.into()));
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Takes one snapshot. Returns `None` if the service does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a describe call fails.
    pub async fn snapshot(&self, cluster: &str, service: &str) -> Result<Option<ServiceSnapshot>> {
        let Some(info) = self
            .api
            .describe_service(cluster, service)
            .await?
            .filter(ServiceInfo::is_active)
        else {
            return Ok(None);
        };

        let tasks = self.api.describe_service_tasks(cluster, service).await?;
        let unhealthy_tasks = count(tasks.iter().filter(|t| t.health == TaskHealth::Unhealthy));

        let healthy_targets = match info.target_group_arns.first() {
            Some(arn) => count(
                self.api
                    .describe_target_health(arn)
                    .await?
                    .iter()
                    .filter(|t| t.is_healthy()),
            ),
            None => count(tasks.iter().filter(|t| t.is_running())),
        };

        let probe = match &self.probe {
            Some((probe, url)) => Some(probe.check(url).await),
            None => None,
        };

        Ok(Some(ServiceSnapshot {
            cluster: cluster.to_string(),
            service: service.to_string(),
            status: info.status,
            desired: info.desired_count,
            running: info.running_count,
            pending: info.pending_count,
            healthy_targets,
            unhealthy_tasks,
            rollout: info.rollout,
            deployments: info.deployments,
            task_definition_arn: info.task_definition_arn,
            probe,
            observed_at: Utc::now(),
        }))
    }

    /// Polls until the service converges, degrades, or `timeout` passes.
    ///
    /// The last poll happens exactly at the deadline. Transient errors are
    /// logged and polling continues. Dropping the future stops polling.
    ///
    /// # Errors
    ///
    /// Returns an error if the service does not exist or a describe call
    /// fails permanently.
    pub async fn wait(
        &self,
        cluster: &str,
        service: &str,
        timeout: Duration,
    ) -> Result<ConvergenceOutcome> {
        info!("Waiting up to {}s for {cluster}/{service} to converge", timeout.as_secs());

        let deadline = Instant::now() + timeout;
        let mut flaps = 0;
        let mut reached = false;
        let mut last: Option<ServiceSnapshot> = None;

        loop {
            match self.snapshot(cluster, service).await {
                Ok(Some(snapshot)) => {
                    self.progress.report(&ProgressEvent::Poll {
                        desired: snapshot.desired,
                        running: snapshot.running,
                        pending: snapshot.pending,
                        healthy: snapshot.healthy_targets,
                    });
                    debug!(
                        "{cluster}/{service}: running {}/{}, pending {}, healthy {}",
                        snapshot.running, snapshot.desired, snapshot.pending, snapshot.healthy_targets
                    );

                    if snapshot.rollout == Some(RolloutState::Failed) {
                        return Ok(ConvergenceOutcome::Degraded {
                            snapshot,
                            reason: String::from("deployment rollout failed"),
                        });
                    }

                    if snapshot.running >= snapshot.desired && snapshot.desired > 0 {
                        reached = true;
                    } else if reached {
                        reached = false;
                        flaps += 1;
                        warn!(
                            "{cluster}/{service}: running count fell to {} of {} ({flaps}/{})",
                            snapshot.running, snapshot.desired, self.flap_threshold
                        );
                        if flaps >= self.flap_threshold {
                            return Ok(ConvergenceOutcome::Degraded {
                                snapshot,
                                reason: format!("running count fell below desired {flaps} times"),
                            });
                        }
                    }

                    if snapshot.is_converged() {
                        info!("{cluster}/{service} converged");
                        return Ok(ConvergenceOutcome::Succeeded(snapshot));
                    }
                    last = Some(snapshot);
                }
                Ok(None) => {
                    return Err(CloudError::not_found(
                        "DescribeServices",
                        format!("service {service} not found in cluster {cluster}"),
                    )
                    .into());
                }
                Err(e) if e.is_retryable() => warn!("Poll failed, will retry: {e}"),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                let snapshot = last.unwrap_or_else(|| ServiceSnapshot::unobserved(cluster, service));
                warn!("{cluster}/{service} did not converge within {}s", timeout.as_secs());
                return Ok(ConvergenceOutcome::TimedOut { snapshot, timeout });
            }

            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

impl ConvergenceOutcome {
    /// Returns the snapshot the outcome carries.
    #[must_use]
    pub const fn snapshot(&self) -> &ServiceSnapshot {
        match self {
            Self::Succeeded(snapshot)
            | Self::TimedOut { snapshot, .. }
            | Self::Degraded { snapshot, .. } => snapshot,
        }
    }

    /// Converts a non-success outcome into an error.
    ///
    /// # Errors
    ///
    /// Returns `ConvergenceError::Timeout` or `ConvergenceError::Degraded`.
    pub fn into_result(self) -> Result<ServiceSnapshot> {
        match self {
            Self::Succeeded(snapshot) => Ok(snapshot),
            Self::TimedOut { snapshot, timeout } => Err(ConvergenceError::Timeout {
                cluster: snapshot.cluster,
                service: snapshot.service,
                timeout_secs: timeout.as_secs(),
                desired: snapshot.desired,
                running: snapshot.running,
                pending: snapshot.pending,
                healthy: snapshot.healthy_targets,
            }
            .into()),
            Self::Degraded { snapshot, reason } => Err(ConvergenceError::Degraded {
                cluster: snapshot.cluster,
                service: snapshot.service,
                reason,
            }
            .into()),
        }
    }
}

fn count<I: Iterator>(iter: I) -> u32 {
    u32::try_from(iter.count()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fake::{FakeCloud, test_spec};
    use crate::error::DeployError;

    async fn provisioned() -> Arc<FakeCloud> {
        let fake = Arc::new(FakeCloud::new());
        fake.provision(&test_spec()).await;
        fake
    }

    fn reporter(fake: &Arc<FakeCloud>) -> StatusReporter {
        StatusReporter::new(fake.clone(), &test_spec().rollout.convergence)
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_converged() {
        let fake = provisioned().await;
        let started = Instant::now();

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(outcome, ConvergenceOutcome::Succeeded(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_polls() {
        let fake = provisioned().await;
        fake.script_running(&[0, 1, 1, 2]);
        let started = Instant::now();

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(outcome.snapshot().running, 2);
        assert!(matches!(outcome, ConvergenceOutcome::Succeeded(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_exactly_at_deadline() {
        let fake = provisioned().await;
        fake.script_running(&[1]);
        let started = Instant::now();

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(12))
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(12));
        let err = outcome.into_result().unwrap_err();
        assert!(matches!(
            err,
            DeployError::Convergence(ConvergenceError::Timeout {
                timeout_secs: 12,
                desired: 2,
                running: 1,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_api_times_out() {
        let fake = provisioned().await;
        fake.fail_transient("DescribeServices", 1000);
        let started = Instant::now();

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(12))
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(12));
        match &outcome {
            ConvergenceOutcome::TimedOut { snapshot, timeout } => {
                assert_eq!(*timeout, Duration::from_secs(12));
                assert_eq!(snapshot.status, "UNKNOWN");
                assert_eq!(snapshot.service, "lamp");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            outcome.into_result().unwrap_err(),
            DeployError::Convergence(ConvergenceError::Timeout { timeout_secs: 12, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_is_degraded() {
        let fake = provisioned().await;
        fake.set_rollout(RolloutState::InProgress);
        fake.script_running(&[2, 1, 2, 1, 2, 1]);

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(600))
            .await
            .unwrap();

        match outcome {
            ConvergenceOutcome::Degraded { reason, .. } => assert!(reason.contains("3 times")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rollout_is_degraded() {
        let fake = provisioned().await;
        fake.set_rollout(RolloutState::Failed);

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(outcome, ConvergenceOutcome::Degraded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_error_is_retried() {
        let fake = provisioned().await;
        fake.fail_transient("DescribeServices", 1);

        let outcome = reporter(&fake)
            .wait("lamp-cluster", "lamp", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(outcome, ConvergenceOutcome::Succeeded(_)));
        assert_eq!(fake.attempts("DescribeServices"), 2);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let fake = Arc::new(FakeCloud::new());
        assert!(reporter(&fake).snapshot("lamp-cluster", "lamp").await.unwrap().is_none());
        assert!(
            reporter(&fake)
                .wait("lamp-cluster", "lamp", Duration::from_secs(5))
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_wait_stops_polling() {
        let fake = provisioned().await;
        fake.script_running(&[0]);

        let reporter = reporter(&fake);
        let wait = reporter.wait("lamp-cluster", "lamp", Duration::from_secs(600));
        let result = tokio::time::timeout(Duration::from_secs(11), wait).await;
        assert!(result.is_err());

        let polls = fake.attempts("DescribeServices");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.attempts("DescribeServices"), polls);
        assert_eq!(polls, 3);
    }
}
