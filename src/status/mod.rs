//! Service status and convergence.
//!
//! This module reads the live state of a deployed service, optionally
//! probes its public endpoint, and polls until the service converges,
//! degrades, or a deadline passes.

mod probe;
mod reporter;

pub use probe::{HttpProbe, ProbeResult};
pub use reporter::{ConvergenceOutcome, ServiceSnapshot, StatusReporter};
