//! Quality gate execution engine.
//!
//! Takes a fully-resolved [`model::ExecutionPlan`], runs every manual and
//! automated check concurrently, and folds the results into the
//! Chapter → Requirement → Check tree with rolled-up statuses.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod graph;
pub mod logging;
pub mod manual;
pub mod model;
pub mod orchestrator;
pub mod replacer;
pub mod result;
pub mod runner;
pub mod telemetry;

pub use aggregate::{aggregate, Aggregator, RunDocument, RunInfo, Statistics};
pub use config::{ConfigResolver, DirConfigResolver, MemoryConfigResolver};
pub use error::{ExecutionError, ExecutionResult, ReplaceBatchError, ReplaceError, RunError};
pub use executor::CheckExecutor;
pub use graph::{prepare_plan, schedule_autopilot, StepGraph};
pub use logging::CheckLogger;
pub use model::{
    Autopilot, AutopilotCheck, Environment, ExecutionPlan, Finalize, Item, ManualCheck, Status,
    Step,
};
pub use orchestrator::{run_finalizer, Orchestrator, RunResult};
pub use replacer::{replace_config_content, replace_initial};
pub use result::{CheckResult, CheckType, Evaluation};
pub use runner::{ScriptOutput, ScriptRunner, SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};
pub use telemetry::init_tracing;

/// Tool version stamped into result documents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
