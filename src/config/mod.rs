//! Deployment descriptor handling.
//!
//! This module handles everything about the desired state:
//! - Parsing `ecs-deploy.yaml` and layering environment overrides
//! - Validating fields against AWS naming and sizing rules
//! - Hashing the descriptor for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::SpecHasher;
pub use parser::{
    DEFAULT_SPEC_FILES, ENV_PREFIX, SpecLoader, apply_env_overrides, find_spec_file,
    interpolate_environment,
};
pub use spec::{
    ClusterSpec, ContainerSpec, ConvergenceSpec, DeploymentSpec, HealthCheckSpec,
    LoadBalancerScheme, LoadBalancerSpec, NetworkSpec, RetrySpec, RolloutSpec, ServiceSpec,
    StateBackend, StateSpec, TargetGroupSpec, TaskSpec,
};
pub use validator::{FieldError, SpecValidator, ValidationResult, is_valid_ecs_name};
