// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![forbid(unsafe_code)]               // Unsafe code is forbidden
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

//! # Terrace
//!
//! A declarative, idempotent infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Terrace reads a YAML description of resources and converges real
//! infrastructure towards it:
//!
//! - Resources reference each other's attributes, which orders creation
//! - Every run computes a plan of create, update, replace and destroy actions
//! - Independent actions run concurrently, bounded by a parallelism limit
//! - A state document records what exists so later runs only change the difference
//!
//! ## Architecture
//!
//! 1. **Model**: `terrace.yaml` parsed into resources, data sources and outputs
//! 2. **Graph**: dependencies extracted from references, cycles rejected
//! 3. **Plan**: desired resources diffed against recorded state
//! 4. **Execution**: actions applied through a provider adapter, state written after each one
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`model`]: Resources, values, references and variables
//! - [`graph`]: Dependency graph and ordering
//! - [`planner`]: Diff computation, plans and execution
//! - [`provider`]: Provider adapters (simulated, HTTP)
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`outputs`]: Output evaluation
//! - [`reconciler`]: Plan and apply orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web
//!   environment: dev
//!
//! resources:
//!   aws_vpc:
//!     main:
//!       cidr_block: 10.0.0.0/16
//!   aws_subnet:
//!     public:
//!       vpc_id: ${aws_vpc.main.id}
//!       cidr_block: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod outputs;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, TerraceConfig};
pub use error::{Result, TerraceError};
pub use graph::DependencyGraph;
pub use model::{ResourceId, ResourceModel};
pub use outputs::{OutputSet, OutputValue};
pub use planner::{CancellationSignal, ExecutionReport, Plan, PlanExecutor, PlanMode};
pub use provider::{ProviderAdapter, SimulatedProvider};
pub use reconciler::{Reconciler, RunResult};
pub use state::{LocalStateStore, S3StateStore, StateDocument, StateStore};
