// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # ecs-deploy
//!
//! Declarative, idempotent deployment of a containerised service to Amazon ECS
//! behind an Application Load Balancer.
//!
//! ## Overview
//!
//! A single YAML descriptor names the cluster, task definition, service,
//! load balancer, listener and target group. Each run:
//!
//! - Loads and validates the descriptor
//! - Reads the live resources and computes an ordered plan
//! - Applies the plan with bounded concurrency and retries on transient errors
//! - Polls the service until it converges, degrades, or times out
//! - Records the outcome and resolved identifiers in the state store
//!
//! ## Architecture
//!
//! A run walks `Loading → Diffing → Applying → Converging` and ends in
//! `Succeeded`, `Failed` or `TimedOut`. Runs against one cluster are
//! serialized by a lock in the state store.
//!
//! ## Modules
//!
//! - [`config`]: Descriptor parsing, validation and hashing
//! - [`aws`]: Control-plane trait, SDK client and observation
//! - [`planner`]: Diff computation, plan ordering and the apply engine
//! - [`status`]: Service snapshots, endpoint probes and convergence polling
//! - [`reconciler`]: The run state machine
//! - [`state`]: Records and run locks (local, S3)
//! - [`progress`]: Structured progress events
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! region: us-east-1
//! cluster:
//!   name: lamp-cluster
//! service:
//!   name: lamp
//!   desired_count: 2
//! task:
//!   family: lamp
//!   cpu: 256
//!   memory: 512
//!   execution_role_arn: arn:aws:iam::123456789012:role/ecsTaskExecutionRole
//!   container:
//!     name: web
//!     image: public.ecr.aws/docker/library/httpd:2.4
//!     port: 80
//! network:
//!   vpc_id: vpc-0abc
//!   subnets: [subnet-0a, subnet-0b]
//!   security_groups: [sg-0web]
//! load_balancer:
//!   name: lamp-alb
//!   listener_port: 80
//! target_group:
//!   name: lamp-tg
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod aws;
pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod progress;
pub mod reconciler;
pub mod state;
pub mod status;

// ============================================================================
// Re-exports
// ============================================================================

pub use aws::{AwsCloud, CloudApi, StateObserver};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{DeploymentSpec, SpecHasher, SpecLoader, SpecValidator};
pub use error::{DeployError, Result};
pub use planner::{ApplyEngine, DiffEngine, Plan};
pub use reconciler::{Reconciler, RunOutcome, RunPhase};
pub use state::{LocalStateStore, S3StateStore, StateStore};
pub use status::{ConvergenceOutcome, StatusReporter};
