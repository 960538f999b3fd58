//! Planning and execution.
//!
//! The diff engine compares the desired resources with recorded state, the
//! plan orders the resulting actions, and the executor carries them out.

mod diff;
mod executor;
mod plan;

pub use diff::{AttributeChange, DiffEngine, DiffResult, DiffType, PlanMode, PlannedValue, ResourceDiff};
pub use executor::{
    ActionOutcome, ActionStatus, CancellationSignal, ExecutionReport, ExecutorOptions, PlanExecutor,
};
pub use plan::{ActionKind, Plan, PlanSummary, PlannedAction, ReplacePhase};
