//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ConvergenceSpec, StateBackend, StateSpec};

/// Declarative deployment of containerised services to ECS behind an ALB.
#[derive(Parser, Debug)]
#[command(name = "ecs-deploy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "ECS_DEPLOY_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// AWS region, overriding the descriptor and the credential chain.
    #[arg(long, global = true, env = "ECS_DEPLOY_REGION")]
    pub region: Option<String>,

    /// Local state directory.
    #[arg(long, global = true, env = "ECS_DEPLOY_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// S3 bucket holding state; selects the s3 backend.
    #[arg(long, global = true, env = "ECS_DEPLOY_STATE_BUCKET")]
    pub state_bucket: Option<String>,

    /// Key prefix inside the state bucket.
    #[arg(long, global = true, env = "ECS_DEPLOY_STATE_PREFIX")]
    pub state_prefix: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter descriptor and .env example.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a descriptor without calling AWS.
    Validate {
        /// Descriptor file (searched for when omitted).
        #[arg(env = "ECS_DEPLOY_SPEC")]
        spec: Option<PathBuf>,
    },

    /// Show what a deploy would change.
    Plan {
        /// Descriptor file (searched for when omitted).
        #[arg(env = "ECS_DEPLOY_SPEC")]
        spec: Option<PathBuf>,
    },

    /// Create or update every resource and wait for the service to converge.
    Deploy {
        /// Descriptor file (searched for when omitted).
        #[arg(env = "ECS_DEPLOY_SPEC")]
        spec: Option<PathBuf>,

        /// Run options.
        #[command(flatten)]
        run: RunArgs,
    },

    /// As deploy, but refuse when the service does not exist yet.
    Update {
        /// Descriptor file (searched for when omitted).
        #[arg(env = "ECS_DEPLOY_SPEC")]
        spec: Option<PathBuf>,

        /// Run options.
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show the live status of a service.
    Status {
        /// Cluster name.
        cluster: String,

        /// Service name.
        service: String,

        /// Poll until the service converges or the timeout passes.
        #[arg(short, long)]
        wait: bool,

        /// Seconds to wait with --wait.
        #[arg(long, default_value = "600")]
        timeout: u64,

        /// Seconds between polls with --wait.
        #[arg(long, default_value = "15")]
        interval: u64,

        /// Also request the load balancer health check path.
        #[arg(long)]
        probe: bool,
    },

    /// Delete a service and the resources created for it.
    Teardown {
        /// Cluster name.
        cluster: String,

        /// Service name.
        service: String,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect recorded state and locks.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Options shared by deploy and update.
#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub struct RunArgs {
    /// Return after applying, without waiting for convergence.
    #[arg(long)]
    pub no_wait: bool,

    /// Keep applying independent resources after a failure.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Request the load balancer health check path while converging.
    #[arg(long)]
    pub probe: bool,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the record and run history of a service.
    Show {
        /// Cluster name.
        cluster: String,

        /// Service name.
        service: String,
    },

    /// Remove the run lock of a cluster.
    Unlock {
        /// Cluster name.
        cluster: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// State backend settings, with command-line flags taking precedence
    /// over the descriptor.
    #[must_use]
    pub fn state_settings(&self, from_spec: Option<&StateSpec>) -> StateSpec {
        let mut settings = from_spec.cloned().unwrap_or_default();

        if let Some(bucket) = &self.state_bucket {
            settings.backend = StateBackend::S3;
            settings.bucket = Some(bucket.clone());
        } else if let Some(dir) = &self.state_dir {
            settings.backend = StateBackend::Local;
            settings.path = Some(dir.display().to_string());
        }
        if let Some(prefix) = &self.state_prefix {
            settings.prefix = Some(prefix.clone());
        }
        if settings.region.is_none() {
            settings.region.clone_from(&self.region);
        }
        settings
    }
}

impl Commands {
    /// Convergence settings for `status --wait`.
    #[must_use]
    pub fn convergence(&self) -> ConvergenceSpec {
        match self {
            Self::Status {
                timeout, interval, ..
            } => ConvergenceSpec {
                interval_secs: (*interval).max(1),
                timeout_secs: *timeout,
                ..ConvergenceSpec::default()
            },
            _ => ConvergenceSpec::default(),
        }
    }
}
