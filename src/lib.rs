// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items should be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
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

//! # Skyforge
//!
//! A declarative, idempotent infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Skyforge turns a stack document into a set of cloud resources:
//!
//! - Declare resources and their references in `skyforge.stack.yaml`
//! - Build a dependency graph from `{ref: ...}` and `${id.output}` references
//! - Diff the graph against persisted state and plan ordered steps
//! - Execute independent steps concurrently with bounded retries
//! - Record every completed step so a failed run can be resumed
//!
//! ## Architecture
//!
//! 1. **Graph**: [`graph::GraphBuilder`] turns declarations into a DAG
//! 2. **Diff**: [`planner::DiffEngine`] classifies create, update, replace and delete
//! 3. **Plan**: [`planner::Planner`] orders steps, honoring replacement strategies
//! 4. **Execute**: [`planner::PlanExecutor`] drives a [`provider::Provider`]
//! 5. **State**: [`state::StateStore`] persists records and serializes runs
//!
//! ## Modules
//!
//! - [`config`]: Stack document parsing and validation
//! - [`graph`]: Resource graph, kind schemas and references
//! - [`planner`]: Diff computation, planning and execution
//! - [`provider`]: Cloud provider abstraction (HTTP and in-memory)
//! - [`state`]: State storage backends (local, S3)
//! - [`reconciler`]: Run coordination under the state lock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: prod
//!
//! resources:
//!   - id: assets
//!     kind: S3Bucket
//!     properties:
//!       bucket_name: shop-assets
//!   - id: cdn
//!     kind: CloudFrontDistribution
//!     properties:
//!       origin: "${assets.domain_name}"
//!
//! outputs:
//!   AssetsArn: { ref: assets.arn }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, SkyforgeError};
pub use graph::{GraphBuilder, ResourceGraph, SchemaRegistry};
pub use planner::{DiffEngine, ExecutionPlan, PlanExecutor, Planner, RunContext};
pub use provider::{HttpProvider, MemoryProvider, Provider};
pub use reconciler::{Reconciler, RunResult};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
