//! Deployment descriptor validation.
//!
//! Field-level rules (required values, numeric ranges) are declared on the
//! descriptor types with `validator` derives. This module runs them, flattens
//! their nested reports into dotted field paths, and adds the cross-field and
//! format rules that AWS imposes on names, identifiers and task sizing.

use ::validator::{Validate, ValidationErrors, ValidationErrorsKind};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::error::{ConfigError, DeployError, Result};

use super::spec::{DeploymentSpec, StateBackend};

/// Maximum length of ECS cluster, service, family and container names.
const MAX_ECS_NAME_LEN: usize = 255;

/// Maximum length of load balancer and target group names.
const MAX_ELB_NAME_LEN: usize = 32;

/// Valid Fargate CPU units and the memory range (MiB) and step for each.
///
/// 256 CPU units additionally exclude 1536 MiB.
const FARGATE_SIZES: &[(u32, u32, u32, u32)] = &[
    (256, 512, 2048, 512),
    (512, 1024, 4096, 1024),
    (1024, 2048, 8192, 1024),
    (2048, 4096, 16384, 1024),
    (4096, 8192, 30720, 1024),
    (8192, 16384, 61440, 4096),
    (16384, 32768, 122_880, 8192),
];

/// Validator for deployment descriptors.
#[derive(Debug, Default)]
pub struct SpecValidator;

/// Validation result containing all findings.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// Fatal findings.
    pub errors: Vec<FieldError>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path of the field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl SpecValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment descriptor.
    ///
    /// Returns the findings on success so callers can show warnings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first invalid field.
    pub fn validate(&self, spec: &DeploymentSpec) -> Result<ValidationResult> {
        let result = self.check(spec);

        if let Some(first) = result.errors.first() {
            debug!("Spec validation failed with {} errors", result.errors.len());
            return Err(DeployError::Config(ConfigError::ValidationError {
                message: format!("{}: {}", first.field, first.message),
                field: Some(first.field.clone()),
            }));
        }

        debug!("Spec validation passed");
        Ok(result)
    }

    /// Runs every rule and collects all findings without failing.
    #[must_use]
    pub fn check(&self, spec: &DeploymentSpec) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = spec.validate() {
            let mut derived = Vec::new();
            flatten("", &errors, &mut derived);
            derived.sort_by(|a, b| {
                field_rank(&a.field)
                    .cmp(&field_rank(&b.field))
                    .then_with(|| a.field.cmp(&b.field))
            });
            result.errors.extend(derived);
        }

        Self::check_names(spec, &mut result);
        Self::check_container(spec, &mut result);
        Self::check_network(spec, &mut result);
        Self::check_sizing(spec, &mut result);
        Self::check_rollout(spec, &mut result);
        Self::check_state(spec, &mut result);

        result
    }

    fn check_names(spec: &DeploymentSpec, result: &mut ValidationResult) {
        let ecs_names = [
            ("cluster.name", spec.cluster.name.clone()),
            ("service.name", spec.service.name.clone()),
            ("task.family", spec.task_family()),
            ("task.container.name", spec.container_name()),
        ];

        for (field, name) in ecs_names {
            // empty names are reported by the required rules
            if !name.is_empty() && !is_valid_ecs_name(&name) {
                result.error(
                    field,
                    format!(
                        "'{name}' must be 1-{MAX_ECS_NAME_LEN} letters, numbers, hyphens or underscores"
                    ),
                );
            }
        }

        if spec.service.name.is_empty() {
            return;
        }

        let lb_name = spec.load_balancer_name();
        if !is_valid_elb_name(&lb_name) || lb_name.starts_with("internal-") {
            result.error(
                "load_balancer.name",
                format!(
                    "'{lb_name}' must be 1-{MAX_ELB_NAME_LEN} alphanumerics or hyphens, not starting or ending with a hyphen or 'internal-'"
                ),
            );
        }

        let tg_name = spec.target_group_name();
        if !is_valid_elb_name(&tg_name) {
            result.error(
                "target_group.name",
                format!(
                    "'{tg_name}' must be 1-{MAX_ELB_NAME_LEN} alphanumerics or hyphens, not starting or ending with a hyphen"
                ),
            );
        }
    }

    fn check_container(spec: &DeploymentSpec, result: &mut ValidationResult) {
        let container = &spec.task.container;

        if !container.image.is_empty() {
            if is_valid_image_ref(&container.image) {
                match image_tag(&container.image) {
                    ImageTag::Missing => result.warn(format!(
                        "task.container.image '{}' has no tag; ':latest' will be pulled",
                        container.image
                    )),
                    ImageTag::Tag("latest") => result.warn(format!(
                        "task.container.image '{}' uses the mutable 'latest' tag",
                        container.image
                    )),
                    _ => {}
                }
            } else {
                result.error(
                    "task.container.image",
                    format!("'{}' is not a valid image reference", container.image),
                );
            }

            if container.image.contains(".dkr.ecr.") && spec.task.execution_role_arn.is_none() {
                result.warn(String::from(
                    "task.execution_role_arn is unset; pulling from ECR requires an execution role",
                ));
            }
        }

        for key in container.environment.keys() {
            if !is_valid_env_name(key) {
                result.error(
                    format!("task.container.environment.{key}"),
                    String::from("environment variable names must match [A-Za-z_][A-Za-z0-9_]*"),
                );
            }
        }

        for (field, arn) in [
            ("task.execution_role_arn", &spec.task.execution_role_arn),
            ("task.task_role_arn", &spec.task.task_role_arn),
        ] {
            if let Some(arn) = arn
                && !is_valid_role_arn(arn)
            {
                result.error(field, format!("'{arn}' is not an IAM role ARN"));
            }
        }
    }

    fn check_network(spec: &DeploymentSpec, result: &mut ValidationResult) {
        let network = &spec.network;

        if !network.vpc_id.is_empty() && !is_valid_resource_id(&network.vpc_id, "vpc-") {
            result.error(
                "network.vpc_id",
                format!("'{}' is not a VPC id (vpc-xxxxxxxx)", network.vpc_id),
            );
        }

        let mut seen = HashSet::new();
        for (i, subnet) in network.subnets.iter().enumerate() {
            if !is_valid_resource_id(subnet, "subnet-") {
                result.error(
                    format!("network.subnets[{i}]"),
                    format!("'{subnet}' is not a subnet id (subnet-xxxxxxxx)"),
                );
            } else if !seen.insert(subnet) {
                result.error(format!("network.subnets[{i}]"), format!("duplicate subnet '{subnet}'"));
            }
        }

        if seen.len() == 1 {
            result.error(
                "network.subnets",
                String::from("an application load balancer needs at least two subnets in different availability zones"),
            );
        }

        for (i, group) in network.security_groups.iter().enumerate() {
            if !is_valid_resource_id(group, "sg-") {
                result.error(
                    format!("network.security_groups[{i}]"),
                    format!("'{group}' is not a security group id (sg-xxxxxxxx)"),
                );
            }
        }

        if let Some(groups) = &spec.load_balancer.security_groups {
            for (i, group) in groups.iter().enumerate() {
                if !is_valid_resource_id(group, "sg-") {
                    result.error(
                        format!("load_balancer.security_groups[{i}]"),
                        format!("'{group}' is not a security group id (sg-xxxxxxxx)"),
                    );
                }
            }
        }

        if network.security_groups.is_empty() {
            result.warn(String::from(
                "network.security_groups is empty; the VPC default security group will be used",
            ));
        }

        if let Some(region) = &spec.region
            && !is_valid_region(region)
        {
            result.error("region", format!("'{region}' is not an AWS region name"));
        }
    }

    fn check_sizing(spec: &DeploymentSpec, result: &mut ValidationResult) {
        let (cpu, memory) = (spec.task.cpu, spec.task.memory);

        match FARGATE_SIZES.iter().find(|(units, ..)| *units == cpu) {
            None => result.error(
                "task.cpu",
                format!("{cpu} is not a Fargate CPU size (256, 512, 1024, 2048, 4096, 8192, 16384)"),
            ),
            Some(&(_, min, max, step)) => {
                let in_range = (min..=max).contains(&memory);
                let on_grid = in_range
                    && (memory - min) % step == 0
                    && !(cpu == 256 && memory == 1536);
                if !on_grid {
                    result.error(
                        "task.memory",
                        format!("{memory} MiB is not valid with {cpu} CPU units ({min}-{max} MiB in {step} MiB steps)"),
                    );
                }
            }
        }

        if spec.service.desired_count == 0 {
            result.warn(String::from("service.desired_count is 0; the service will run no tasks"));
        }

        let health = &spec.target_group.health_check;
        if health.timeout_secs >= health.interval_secs {
            result.error(
                "target_group.health_check.timeout_secs",
                format!(
                    "timeout ({}s) must be less than the interval ({}s)",
                    health.timeout_secs, health.interval_secs
                ),
            );
        }
        if !is_valid_matcher(&health.matcher) {
            result.error(
                "target_group.health_check.matcher",
                format!("'{}' must be HTTP codes like 200, 200,202 or 200-399", health.matcher),
            );
        }
    }

    fn check_rollout(spec: &DeploymentSpec, result: &mut ValidationResult) {
        let retry = &spec.rollout.retry;
        if retry.base_delay_ms > retry.max_delay_ms {
            result.error(
                "rollout.retry.base_delay_ms",
                format!(
                    "base delay ({}ms) exceeds max delay ({}ms)",
                    retry.base_delay_ms, retry.max_delay_ms
                ),
            );
        }

        let convergence = &spec.rollout.convergence;
        if convergence.interval_secs > convergence.timeout_secs {
            result.error(
                "rollout.convergence.interval_secs",
                format!(
                    "poll interval ({}s) exceeds the timeout ({}s)",
                    convergence.interval_secs, convergence.timeout_secs
                ),
            );
        }
    }

    fn check_state(spec: &DeploymentSpec, result: &mut ValidationResult) {
        if spec.state.backend == StateBackend::S3 && spec.state.bucket.as_ref().is_none_or(String::is_empty) {
            result.error(
                "state.bucket",
                String::from("S3 bucket name is required when using the s3 backend"),
            );
        }
    }
}

impl ValidationResult {
    /// Returns true if there are no errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: String) {
        self.errors.push(FieldError {
            field: field.into(),
            message,
        });
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() && self.warnings.is_empty() {
            return write!(f, "Spec is valid");
        }

        if !self.errors.is_empty() {
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                writeln!(f, "  - {error}")?;
            }
        }

        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }

        Ok(())
    }
}

/// Flattens a nested `validator` report into dotted field paths.
fn flatten(prefix: &str, errors: &ValidationErrors, out: &mut Vec<FieldError>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };

        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    out.push(FieldError {
                        field: path.clone(),
                        message: error
                            .message
                            .as_ref()
                            .map_or_else(|| error.code.to_string(), ToString::to_string),
                    });
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (i, inner) in items {
                    flatten(&format!("{path}[{i}]"), inner, out);
                }
            }
        }
    }
}

/// Orders derived errors so the required identity fields come first.
fn field_rank(field: &str) -> usize {
    const ORDER: &[&str] = &["cluster", "service", "task.container", "network", "task"];
    ORDER
        .iter()
        .position(|p| field.starts_with(p))
        .unwrap_or(ORDER.len())
}

/// ECS names: letters, numbers, hyphens and underscores.
#[must_use]
pub fn is_valid_ecs_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ECS_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Load balancer and target group names: alphanumerics and inner hyphens.
fn is_valid_elb_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ELB_NAME_LEN
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `vpc-`, `subnet-` or `sg-` followed by 8 or 17 hex digits.
fn is_valid_resource_id(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix).is_some_and(|suffix| {
        (suffix.len() == 8 || suffix.len() == 17) && suffix.chars().all(|c| c.is_ascii_hexdigit())
    })
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_role_arn(arn: &str) -> bool {
    arn.starts_with("arn:aws") && arn.contains(":iam::") && arn.contains(":role/")
}

fn is_valid_region(region: &str) -> bool {
    let parts: Vec<&str> = region.split('-').collect();
    parts.len() >= 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()))
}

fn is_valid_matcher(matcher: &str) -> bool {
    let is_code = |s: &str| s.len() == 3 && s.chars().all(|c| c.is_ascii_digit());
    !matcher.is_empty()
        && matcher.split(',').all(|part| match part.split_once('-') {
            Some((lo, hi)) => is_code(lo) && is_code(hi) && lo <= hi,
            None => is_code(part),
        })
}

/// Tag portion of an image reference.
#[derive(Debug, PartialEq, Eq)]
enum ImageTag<'a> {
    Missing,
    Tag(&'a str),
    Digest,
}

fn image_tag(image: &str) -> ImageTag<'_> {
    if image.contains('@') {
        return ImageTag::Digest;
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment
        .split_once(':')
        .map_or(ImageTag::Missing, |(_, tag)| ImageTag::Tag(tag))
}

/// Checks `[registry[:port]/]repository[:tag][@sha256:digest]`.
fn is_valid_image_ref(image: &str) -> bool {
    if image.is_empty() || image.chars().any(char::is_whitespace) {
        return false;
    }

    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };

    if let Some(digest) = digest {
        let valid = digest
            .strip_prefix("sha256:")
            .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return false;
        }
    }

    let mut segments: Vec<&str> = name.split('/').collect();
    let Some(last) = segments.pop() else {
        return false;
    };

    let repo = match last.split_once(':') {
        Some((repo, tag)) => {
            let tag_ok = !tag.is_empty()
                && tag.len() <= 128
                && tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !tag_ok {
                return false;
            }
            repo
        }
        None => last,
    };

    let is_path_component = |s: &str| {
        !s.is_empty()
            && s.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
            })
    };

    if !is_path_component(repo) {
        return false;
    }

    // the first segment may be a registry host with an optional port
    segments.iter().enumerate().all(|(i, s)| {
        if i == 0 && (s.contains('.') || s.contains(':') || *s == "localhost") {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
        } else {
            is_path_component(s)
        }
    })
}
