//! Planning and applying.
//!
//! This module compares desired and observed state, orders the resulting
//! operations by dependency, and executes them against the control plane.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{DesiredState, DiffEngine, PlanMode};
pub use executor::{ApplyEngine, ApplyReport, OperationOutcome, OperationReport};
pub use plan::{
    FieldChange, Operation, OperationKind, Plan, PlanSummary, ResourceKind, ResourceParams,
    ResourceRef,
};
pub use retry::RetryPolicy;
