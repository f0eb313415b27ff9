//! Deployment descriptor loading.
//!
//! This module reads the YAML descriptor, layers `.env` and `ECS_DEPLOY_*`
//! environment overrides on top of it, and expands `${VAR}` references in
//! container environment values.

use crate::error::{ConfigError, DeployError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeploymentSpec;

/// Prefix of environment variables that override descriptor fields.
pub const ENV_PREFIX: &str = "ECS_DEPLOY_";

/// Descriptor file names searched for when none is given.
pub const DEFAULT_SPEC_FILES: &[&str] = &[
    "ecs-deploy.yaml",
    "ecs-deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Loader for deployment descriptors.
#[derive(Debug, Default)]
pub struct SpecLoader {
    /// Directory holding the descriptor and its `.env` file.
    base_path: Option<PathBuf>,
}

impl SpecLoader {
    /// Creates a new loader.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory used to find the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Creates a loader rooted at the descriptor's parent directory.
    #[must_use]
    pub fn for_file(path: &Path) -> Self {
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::new().with_base_path(base)
    }

    /// Loads a descriptor from a YAML file without environment processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or not valid YAML.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeploymentSpec> {
        let path = path.as_ref();
        info!("Loading deployment spec from: {}", path.display());

        if !path.exists() {
            return Err(DeployError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        Self::parse_yaml(&content, Some(path))
    }

    /// Parses a descriptor from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(content: &str, source: Option<&Path>) -> Result<DeploymentSpec> {
        debug!("Parsing YAML deployment spec");

        let spec: DeploymentSpec = serde_yaml::from_str(content).map_err(|e| {
            let position = e
                .location()
                .map(|loc| format!("{}:{}", loc.line(), loc.column()));
            let location = match (source, position) {
                (Some(p), Some(pos)) => Some(format!("{}:{pos}", p.display())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, pos) => pos,
            };
            DeployError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Parsed deployment spec for service: {}", spec.qualified_name());
        Ok(spec)
    }

    /// Loads a descriptor and applies `.env`, overrides and interpolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded, an override is
    /// malformed, or a value references an unset environment variable.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<DeploymentSpec> {
        self.load_dotenv()?;
        let mut spec = self.load_file(path)?;
        let lookup = |name: &str| std::env::var(name).ok();
        apply_env_overrides(&mut spec, lookup)?;
        interpolate_environment(&mut spec, lookup)?;
        Ok(spec)
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the `.env` file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                DeployError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `ECS_DEPLOY_*` overrides using `lookup` to read variables.
///
/// # Errors
///
/// Returns a validation error naming the overridden field when a numeric
/// override does not parse.
pub fn apply_env_overrides<F>(spec: &mut DeploymentSpec, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

    if let Some(cluster) = var("CLUSTER") {
        debug!("Overriding cluster.name from environment");
        spec.cluster.name = cluster;
    }

    if let Some(service) = var("SERVICE") {
        debug!("Overriding service.name from environment");
        spec.service.name = service;
    }

    if let Some(image) = var("IMAGE") {
        debug!("Overriding task.container.image from environment");
        spec.task.container.image = image;
    }

    if let Some(region) = var("REGION") {
        debug!("Overriding region from environment");
        spec.region = Some(region);
    }

    if let Some(count) = var("DESIRED_COUNT") {
        debug!("Overriding service.desired_count from environment");
        spec.service.desired_count = count.trim().parse().map_err(|_| {
            ConfigError::validation(
                format!("{ENV_PREFIX}DESIRED_COUNT must be a non-negative integer, got '{count}'"),
                "service.desired_count",
            )
        })?;
    }

    if let Some(bucket) = var("STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        spec.state.bucket = Some(bucket);
    }

    Ok(())
}

/// Expands `${VAR}` references in container environment values.
///
/// `$$` escapes a literal dollar sign.
///
/// # Errors
///
/// Returns `ConfigError::MissingEnvVar` for a reference to an unset variable
/// and a validation error for an unterminated reference.
pub fn interpolate_environment<F>(spec: &mut DeploymentSpec, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    for (key, value) in &mut spec.task.container.environment {
        if value.contains('$') {
            *value = interpolate(value, &lookup).map_err(|e| match e {
                ConfigError::ValidationError { message, .. } => ConfigError::validation(
                    message,
                    format!("task.container.environment.{key}"),
                ),
                other => other,
            })?;
        }
    }
    Ok(())
}

fn interpolate<F>(input: &str, lookup: &F) -> std::result::Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or_else(|| {
                ConfigError::validation("unterminated ${...} reference", "task.container.environment")
            })?;
            let name = &body[..end];
            let value = lookup(name).ok_or_else(|| ConfigError::MissingEnvVar {
                name: name.to_string(),
            })?;
            out.push_str(&value);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Finds a descriptor in `start_dir` or its parent directories.
///
/// # Errors
///
/// Returns an error if no descriptor is found.
pub fn find_spec_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let mut current = start_dir.as_ref().to_path_buf();

    loop {
        for name in DEFAULT_SPEC_FILES {
            let candidate = current.join(name);
            if candidate.exists() {
                debug!("Found deployment spec: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(DeployError::Config(ConfigError::FileNotFound {
        path: PathBuf::from(DEFAULT_SPEC_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r"
region: us-east-1
cluster:
  name: lamp-cluster
service:
  name: lamp
  desired_count: 2
task:
  cpu: 512
  memory: 1024
  container:
    image: 123456789012.dkr.ecr.us-east-1.amazonaws.com/lamp:1.0
    port: 80
    environment:
      MYSQL_HOST: db.internal
      MYSQL_PASSWORD: ${DB_PASSWORD}
network:
  vpc_id: vpc-0abc1234
  subnets: [subnet-0aaa1111, subnet-0bbb2222]
  security_groups: [sg-0123abcd]
";

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parse_sample() {
        let spec = SpecLoader::parse_yaml(SAMPLE, None).expect("parse");
        assert_eq!(spec.cluster.name, "lamp-cluster");
        assert_eq!(spec.service.desired_count, 2);
        assert_eq!(spec.task.cpu, 512);
        assert_eq!(spec.task.container.port, Some(80));
        assert_eq!(spec.network.subnets.len(), 2);
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = SpecLoader::parse_yaml("cluster: [unclosed", None).expect_err("invalid yaml");
        match err {
            DeployError::Config(ConfigError::ParseError { location, .. }) => {
                assert!(location.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let err = SpecLoader::parse_yaml("task:\n  container:\n    port: eighty\n", None)
            .expect_err("non-numeric port");
        assert!(matches!(err, DeployError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut spec = SpecLoader::parse_yaml(SAMPLE, None).expect("parse");
        let vars = env(&[
            ("ECS_DEPLOY_IMAGE", "nginx:1.27"),
            ("ECS_DEPLOY_DESIRED_COUNT", "4"),
            ("ECS_DEPLOY_REGION", "eu-west-1"),
        ]);
        apply_env_overrides(&mut spec, |k| vars.get(k).cloned()).expect("overrides");

        assert_eq!(spec.task.container.image, "nginx:1.27");
        assert_eq!(spec.service.desired_count, 4);
        assert_eq!(spec.region.as_deref(), Some("eu-west-1"));
        assert_eq!(spec.cluster.name, "lamp-cluster");
    }

    #[test]
    fn test_non_numeric_desired_count_override() {
        let mut spec = SpecLoader::parse_yaml(SAMPLE, None).expect("parse");
        let vars = env(&[("ECS_DEPLOY_DESIRED_COUNT", "two")]);
        let err = apply_env_overrides(&mut spec, |k| vars.get(k).cloned())
            .expect_err("non-numeric count");

        match err {
            DeployError::Config(config) => {
                assert_eq!(config.field(), Some("service.desired_count"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_interpolation() {
        let mut spec = SpecLoader::parse_yaml(SAMPLE, None).expect("parse");
        let vars = env(&[("DB_PASSWORD", "s3cret")]);
        interpolate_environment(&mut spec, |k| vars.get(k).cloned()).expect("interpolate");

        assert_eq!(
            spec.task.container.environment.get("MYSQL_PASSWORD").map(String::as_str),
            Some("s3cret")
        );
    }

    #[test]
    fn test_interpolation_missing_var() {
        let mut spec = SpecLoader::parse_yaml(SAMPLE, None).expect("parse");
        let err = interpolate_environment(&mut spec, |_| None).expect_err("unset var");
        assert!(matches!(
            err,
            DeployError::Config(ConfigError::MissingEnvVar { ref name }) if name == "DB_PASSWORD"
        ));
    }

    #[test]
    fn test_interpolate_escapes() {
        let lookup = |k: &str| (k == "A").then(|| String::from("x"));
        assert_eq!(interpolate("$${A}", &lookup).expect("escape"), "${A}");
        assert_eq!(interpolate("a-${A}-b", &lookup).expect("expand"), "a-x-b");
        assert_eq!(interpolate("cost $5", &lookup).expect("bare"), "cost $5");
        assert!(interpolate("${A", &lookup).is_err());
    }

    #[test]
    fn test_find_spec_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let nested = dir.path().join("app/deploy");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("ecs-deploy.yaml"), SAMPLE).expect("write");

        let found = find_spec_file(&nested).expect("found in parent");
        assert_eq!(found, dir.path().join("ecs-deploy.yaml"));
    }

    #[test]
    fn test_load_file_missing() {
        let err = SpecLoader::new()
            .load_file("/nonexistent/ecs-deploy.yaml")
            .expect_err("missing file");
        assert!(matches!(err, DeployError::Config(ConfigError::FileNotFound { .. })));
    }
}
