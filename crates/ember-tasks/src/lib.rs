#![forbid(unsafe_code)]
//! Task lifecycle tracking across power loss.
//!
//! Three pieces cooperate here:
//!
//! - [`TaskRegistry`] — the persisted table of "tasks believed running",
//!   written before a task does any work and cleared when it finishes (or
//!   when a commit makes its work durable).
//! - [`TaskMemory`] — persisted per-task flags (run state, stack location)
//!   and the entry-point side table the scheduler glue records at creation.
//! - [`recovery`] — the boot-time pass that turns the two tables back into
//!   a running task set.
//!
//! The scheduler itself is out of scope and consumed through the
//! [`Scheduler`] trait.

pub mod recovery;
mod registry;
mod memory;

pub use memory::{suspend_lengthy, TaskMemory};
pub use recovery::{recover, RecoveryReport, PROMOTE_THRESHOLD};
pub use registry::{RegistryEntry, TaskRegistry};

use ember_arena::ArenaPools;
use ember_error::Result;
use ember_nvm::Fram;
use ember_types::{EntryPoint, NvAddr, Priority, TaskId, TcbNumber};

/// Where a task's stack and control block live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StackLocation {
    /// Volatile working memory: cheap, but the task restarts from scratch
    /// after power loss.
    Volatile,
    /// Durable storage: the execution context survives power loss and the
    /// task can resume from where it stopped ("lengthy" handling).
    Durable,
}

impl StackLocation {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Volatile => 0,
            Self::Durable => 1,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        if value == 0 { Self::Volatile } else { Self::Durable }
    }
}

/// Whether a task's context is known to be fully saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunState {
    /// Context saved; a durable task in this state can be resumed.
    Stopped,
    /// Mid-run; the saved context cannot be trusted.
    Running,
}

impl RunState {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        if value == 0 { Self::Stopped } else { Self::Running }
    }
}

/// Everything the scheduler needs to create a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    pub entry: EntryPoint,
    pub name: &'static str,
    pub stack_bytes: usize,
    pub priority: Priority,
    pub task: TaskId,
    pub location: StackLocation,
    /// Scheduler-internal tasks (idle, timers) are never re-created by the
    /// recovery pass; the scheduler brings them up itself.
    pub scheduler_owned: bool,
}

/// The capabilities the core consumes from the (out-of-scope) scheduler.
pub trait Scheduler {
    /// Create a task instance; returns the fresh control-block number.
    fn create_task(&mut self, spec: &TaskSpec) -> Result<TcbNumber>;

    /// Re-admit a task from its persisted control-block region (resume).
    fn resume_persisted(&mut self, task: TaskId, tcb_addr: NvAddr) -> Result<()>;

    /// Suspend a task, saving its context.
    fn suspend(&mut self, task: TaskId) -> Result<()>;

    /// Delete the currently running task instance.
    fn delete_current(&mut self) -> Result<()>;

    /// Enter the scheduler's run loop.
    fn start(&mut self) -> Result<()>;
}

/// Create a task through the scheduler and record everything recovery needs.
///
/// Persists the entry-point side table and location flag, creates the
/// scheduler task, then arms the registry entry — in that order, so a crash
/// at any point either leaves no trace or a fully-described in-flight entry.
pub fn create_and_track(
    fram: &mut Fram,
    registry: &TaskRegistry,
    memory: &TaskMemory,
    arena: &ArenaPools,
    scheduler: &mut dyn Scheduler,
    spec: &TaskSpec,
) -> Result<TcbNumber> {
    memory.record_entry(fram, spec.task, spec.entry, spec.priority)?;
    memory.set_location(fram, spec.task, spec.location)?;
    memory.set_run_state(fram, spec.task, RunState::Running)?;

    let tcb = scheduler.create_task(spec)?;
    let tcb_addr = match spec.location {
        StackLocation::Durable => arena.tcb_region(spec.task)?,
        StackLocation::Volatile => NvAddr::NONE,
    };
    registry.begin_task(
        fram,
        spec.entry,
        spec.priority,
        tcb,
        tcb_addr,
        spec.scheduler_owned,
        spec.task,
    )?;
    Ok(tcb)
}
