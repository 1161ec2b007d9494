//! Process definitions, runs, and human tasks: the data model and state
//! machines the orchestrator (`dazzle-orchestrator`) drives. Persistence
//! lives here so `dazzle-orchestrator` depends on a storage contract rather
//! than owning `sqlx` itself.

pub mod run;
pub mod spec;
pub mod store;
pub mod task;

pub use run::{ProcessRun, RunStatus, TransitionError};
pub use spec::{ProcessSpec, RetryPolicy, Step, StepKind, Trigger};
pub use store::{ProcessStore, StoreError};
pub use task::{ProcessTask, TaskStatus, TaskTransitionError};
