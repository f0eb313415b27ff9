//! Live state observation.
//!
//! Builds an [`ObservedState`] snapshot either from a descriptor (for
//! planning) or by following references outward from a running service
//! (for `status` and `teardown`, which only know the cluster and service).

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DeploymentSpec;
use crate::error::Result;

use super::api::CloudApi;
use super::types::{Lookup, ObservedState};

/// Observer for the resources of one service.
#[derive(Clone)]
pub struct StateObserver {
    /// Control-plane client.
    api: Arc<dyn CloudApi>,
}

impl std::fmt::Debug for StateObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObserver").finish_non_exhaustive()
    }
}

impl StateObserver {
    /// Creates a new observer.
    #[must_use]
    pub fn new(api: Arc<dyn CloudApi>) -> Self {
        Self { api }
    }

    /// Observes the resources a descriptor names.
    ///
    /// # Errors
    ///
    /// Returns an error if any describe call fails.
    pub async fn observe(&self, spec: &DeploymentSpec) -> Result<ObservedState> {
        info!("Observing resources for {}", spec.qualified_name());

        let lb_name = spec.load_balancer_name();
        let tg_name = spec.target_group_name();
        let family = spec.task_family();

        let (cluster, target_group, load_balancer, task_definition, service) = tokio::try_join!(
            self.api.describe_cluster(&spec.cluster.name),
            self.api.describe_target_group(Lookup::Name(&tg_name)),
            self.api.describe_load_balancer(Lookup::Name(&lb_name)),
            self.api.describe_task_definition(&family),
            self.api.describe_service(&spec.cluster.name, &spec.service.name),
        )?;

        let listener = match (&load_balancer, spec.listener_port()) {
            (Some(lb), Some(port)) => self
                .api
                .describe_listeners(&lb.arn)
                .await?
                .into_iter()
                .find(|l| l.port == port),
            _ => None,
        };

        let observed = ObservedState {
            cluster: cluster.filter(super::types::ClusterInfo::is_active),
            target_group,
            load_balancer,
            listener,
            task_definition,
            service: service.filter(super::types::ServiceInfo::is_active),
        };

        debug!("Observed: {observed:?}");
        Ok(observed)
    }

    /// Discovers the resources attached to an existing service.
    ///
    /// Follows service → task definition, service → target group →
    /// load balancer → listener. Resources that cannot be reached are `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if any describe call fails.
    pub async fn discover(&self, cluster: &str, service: &str) -> Result<ObservedState> {
        info!("Discovering resources of {cluster}/{service}");

        let (cluster_info, service_info) = tokio::try_join!(
            self.api.describe_cluster(cluster),
            self.api.describe_service(cluster, service),
        )?;

        let mut observed = ObservedState {
            cluster: cluster_info.filter(super::types::ClusterInfo::is_active),
            service: service_info.filter(super::types::ServiceInfo::is_active),
            ..ObservedState::default()
        };

        let Some(svc) = observed.service.clone() else {
            debug!("Service {cluster}/{service} not found");
            return Ok(observed);
        };

        if !svc.task_definition_arn.is_empty() {
            observed.task_definition = self.api.describe_task_definition(&svc.task_definition_arn).await?;
        }

        let Some(tg_arn) = svc.target_group_arns.first() else {
            return Ok(observed);
        };
        observed.target_group = self.api.describe_target_group(Lookup::Arn(tg_arn)).await?;

        let Some(lb_arn) = observed
            .target_group
            .as_ref()
            .and_then(|tg| tg.load_balancer_arns.first().cloned())
        else {
            return Ok(observed);
        };
        observed.load_balancer = self.api.describe_load_balancer(Lookup::Arn(&lb_arn)).await?;

        if observed.load_balancer.is_some() {
            observed.listener = self
                .api
                .describe_listeners(&lb_arn)
                .await?
                .into_iter()
                .find(|l| l.target_group_arn.as_deref() == Some(tg_arn.as_str()));
        }

        Ok(observed)
    }

    /// Returns the underlying client.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn CloudApi> {
        &self.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fake::{FakeCloud, test_spec};
    use crate::aws::types::ClusterParams;

    #[tokio::test]
    async fn test_observe_empty() {
        let fake = Arc::new(FakeCloud::new());
        let observer = StateObserver::new(fake);
        let observed = observer.observe(&test_spec()).await.unwrap();
        assert!(observed.is_empty());
    }

    #[tokio::test]
    async fn test_observe_ignores_inactive_cluster() {
        let fake = Arc::new(FakeCloud::new());
        fake.create_cluster(&ClusterParams {
            name: String::from("lamp-cluster"),
            container_insights: false,
        })
        .await
        .unwrap();
        fake.set_cluster_status("lamp-cluster", "INACTIVE");

        let observer = StateObserver::new(fake);
        let observed = observer.observe(&test_spec()).await.unwrap();
        assert!(observed.cluster.is_none());
    }

    #[tokio::test]
    async fn test_discover_follows_references() {
        let fake = Arc::new(FakeCloud::new());
        fake.provision(&test_spec()).await;

        let observer = StateObserver::new(fake);
        let observed = observer.discover("lamp-cluster", "lamp").await.unwrap();

        assert!(observed.cluster.is_some());
        assert!(observed.service.is_some());
        assert!(observed.task_definition.is_some());
        assert!(observed.target_group.is_some());
        assert!(observed.load_balancer.is_some());
        assert!(observed.listener.is_some());
    }

    #[tokio::test]
    async fn test_discover_missing_service() {
        let fake = Arc::new(FakeCloud::new());
        let observer = StateObserver::new(fake);
        let observed = observer.discover("lamp-cluster", "lamp").await.unwrap();
        assert!(observed.is_empty());
    }
}
