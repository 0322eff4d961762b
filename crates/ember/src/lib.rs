#![forbid(unsafe_code)]
//! Ember public API facade.
//!
//! Re-exports the runtime, store, and task-recovery surfaces through one
//! stable external interface. This is the crate downstream consumers (the
//! harness, demos) depend on.

pub use ember_core::{volatile_task, AttemptOutcome, Runtime};
pub use ember_error::{EmberError, Result};
pub use ember_nvm::{Fram, Header};
pub use ember_store::{Attempt, Database, WorkingBuffer};
pub use ember_tasks::{
    RecoveryReport, RunState, Scheduler, StackLocation, TaskSpec, PROMOTE_THRESHOLD,
};
pub use ember_types::{
    EntryPoint, LogicalTime, NvAddr, ObjectId, Priority, StoreGeometry, TaskId, TcbNumber,
    ValidityInterval,
};
