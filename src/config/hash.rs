//! Descriptor hashing for change detection.
//!
//! Hashes are deterministic over the fields that shape cloud resources, so
//! the recorded hash of the last successful run tells whether a descriptor
//! changed, and creation calls can carry stable idempotency tokens.

use sha2::{Digest, Sha256};

use super::spec::DeploymentSpec;

/// Length of an ECS client token.
const CLIENT_TOKEN_LEN: usize = 36;

/// Hasher for computing descriptor hashes.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of everything that shapes the deployed resources.
    ///
    /// Rollout and state settings are excluded: changing a retry bound does
    /// not change what is deployed.
    #[must_use]
    pub fn hash_spec(&self, spec: &DeploymentSpec) -> String {
        let mut hasher = Sha256::new();

        field(&mut hasher, spec.region.as_deref().unwrap_or_default());
        field(&mut hasher, &spec.cluster.name);
        hasher.update([u8::from(spec.cluster.container_insights)]);

        field(&mut hasher, &spec.service.name);
        hasher.update(spec.service.desired_count.to_be_bytes());
        hasher.update([u8::from(spec.service.assign_public_ip)]);
        hasher.update(spec.service.health_check_grace_period_secs.unwrap_or_default().to_be_bytes());

        field(&mut hasher, &self.hash_task_definition(spec));

        field(&mut hasher, &spec.network.vpc_id);
        list(&mut hasher, &spec.network.subnets);
        list(&mut hasher, &spec.network.security_groups);

        field(&mut hasher, &spec.load_balancer_name());
        field(&mut hasher, spec.load_balancer.scheme.as_str());
        hasher.update(spec.load_balancer.listener_port.to_be_bytes());
        list(&mut hasher, &spec.load_balancer_security_groups());

        let health = &spec.target_group.health_check;
        field(&mut hasher, &spec.target_group_name());
        field(&mut hasher, &health.path);
        field(&mut hasher, &health.matcher);
        for value in [
            health.interval_secs,
            health.timeout_secs,
            health.healthy_threshold,
            health.unhealthy_threshold,
        ] {
            hasher.update(value.to_be_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the task definition parameters.
    #[must_use]
    pub fn hash_task_definition(&self, spec: &DeploymentSpec) -> String {
        let mut hasher = Sha256::new();
        let container = &spec.task.container;

        field(&mut hasher, &spec.task_family());
        hasher.update(spec.task.cpu.to_be_bytes());
        hasher.update(spec.task.memory.to_be_bytes());
        field(&mut hasher, spec.task.execution_role_arn.as_deref().unwrap_or_default());
        field(&mut hasher, spec.task.task_role_arn.as_deref().unwrap_or_default());

        field(&mut hasher, &spec.container_name());
        field(&mut hasher, &container.image);
        hasher.update(container.port.unwrap_or_default().to_be_bytes());

        // BTreeMap iteration is already sorted
        hasher.update(container.environment.len().to_be_bytes());
        for (key, value) in &container.environment {
            field(&mut hasher, key);
            field(&mut hasher, value);
        }

        list(&mut hasher, &container.command);

        hex::encode(hasher.finalize())
    }

    /// Returns a stable idempotency token for creating the service.
    #[must_use]
    pub fn service_client_token(&self, spec: &DeploymentSpec) -> String {
        let mut hasher = Sha256::new();
        field(&mut hasher, &spec.cluster.name);
        field(&mut hasher, &spec.service.name);
        field(&mut hasher, &spec.task_family());

        let digest = hex::encode(hasher.finalize());
        let token = format!("ecs-deploy-{digest}");
        token.chars().take(CLIENT_TOKEN_LEN).collect()
    }

    /// Returns the first 8 characters of a hash, for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

/// Feeds a length-prefixed string so adjacent fields cannot run together.
fn field(hasher: &mut Sha256, value: &str) {
    hasher.update(value.len().to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Feeds a list in sorted order; ordering carries no meaning for ids.
fn list(hasher: &mut Sha256, values: &[String]) {
    let mut sorted: Vec<&String> = values.iter().collect();
    sorted.sort();
    hasher.update(sorted.len().to_be_bytes());
    for value in sorted {
        field(hasher, value);
    }
}
