//! Executes process runs step by step: retries, saga compensation, human
//! tasks, scheduling, signals, cancellation.

pub mod engine;
pub mod registry;

pub use engine::{Orchestrator, OrchestratorError};
pub use registry::{FunctionRegistry, StepFunction, StepFunctionError};
