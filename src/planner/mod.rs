//! Planning module for provisioning runs.
//!
//! This module compares the desired graph with the recorded snapshot,
//! orders the resulting changes into an execution plan, and applies the
//! plan against a provider.

mod context;
mod diff;
mod executor;
mod plan;

pub use context::{ExecutionOptions, RetryPolicy, RunContext};
pub use diff::{ChangeOperation, ChangeSet, DiffEngine};
pub use executor::{ExecutionReport, PlanExecutor, RunOutcome, StepResult, StepStatus};
pub use plan::{ExecutionPlan, PlannedStep, Planner, StepAction};
