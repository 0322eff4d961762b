//! Persisted per-task flags and the entry-point side table.
//!
//! Kept in an explicit side table keyed by task id rather than embedded in
//! the scheduler's task control block, so the core never depends on the
//! scheduler's internal task representation.

use crate::{RunState, Scheduler, StackLocation};
use ember_error::{EmberError, Result};
use ember_nvm::{Fram, FramLayout};
use ember_types::{EntryPoint, Priority, TaskId};
use tracing::debug;

/// Per-task persisted flags and entry records over one image layout.
#[derive(Debug, Clone)]
pub struct TaskMemory {
    layout: FramLayout,
}

impl TaskMemory {
    #[must_use]
    pub fn new(layout: FramLayout) -> Self {
        Self { layout }
    }

    fn check_task(&self, task: TaskId) -> Result<usize> {
        let tasks = self.layout.geometry().tasks;
        if usize::from(task.0) >= tasks {
            return Err(EmberError::TaskOutOfRange {
                task: task.0,
                limit: tasks,
            });
        }
        Ok(usize::from(task.0))
    }

    pub fn run_state(&self, fram: &Fram, task: TaskId) -> Result<RunState> {
        let index = self.check_task(task)?;
        Ok(RunState::from_u8(
            fram.read_u8(self.layout.run_flag_offset(index))?,
        ))
    }

    pub fn set_run_state(&self, fram: &mut Fram, task: TaskId, state: RunState) -> Result<()> {
        let index = self.check_task(task)?;
        fram.write_u8(self.layout.run_flag_offset(index), state.to_u8())
    }

    pub fn location(&self, fram: &Fram, task: TaskId) -> Result<StackLocation> {
        let index = self.check_task(task)?;
        Ok(StackLocation::from_u8(
            fram.read_u8(self.layout.loc_flag_offset(index))?,
        ))
    }

    pub fn set_location(&self, fram: &mut Fram, task: TaskId, location: StackLocation) -> Result<()> {
        let index = self.check_task(task)?;
        fram.write_u8(self.layout.loc_flag_offset(index), location.to_u8())
    }

    /// Record the task's entry point and priority for later re-creation.
    pub fn record_entry(
        &self,
        fram: &mut Fram,
        task: TaskId,
        entry: EntryPoint,
        priority: Priority,
    ) -> Result<()> {
        let index = self.check_task(task)?;
        let offset = self.layout.entry_point_offset(index);
        fram.write_u32(offset, entry.0)?;
        fram.write_u16(offset + 4, priority.0)
    }

    pub fn entry_point(&self, fram: &Fram, task: TaskId) -> Result<(EntryPoint, Priority)> {
        let index = self.check_task(task)?;
        let offset = self.layout.entry_point_offset(index);
        Ok((
            EntryPoint(fram.read_u32(offset)?),
            Priority(fram.read_u16(offset + 4)?),
        ))
    }

    /// Clear one task's flags to {stopped, volatile}. Cold start only.
    pub fn reset_task(&self, fram: &mut Fram, task: TaskId) -> Result<()> {
        self.set_run_state(fram, task, RunState::Stopped)?;
        self.set_location(fram, task, StackLocation::Volatile)
    }

    pub fn reset_all(&self, fram: &mut Fram) -> Result<()> {
        for task in 0..self.layout.geometry().tasks {
            #[allow(clippy::cast_possible_truncation)] // tasks validated <= u16::MAX
            self.reset_task(fram, TaskId(task as u16))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.layout.geometry().tasks
    }
}

/// Low-voltage path: suspend every durable-storage task so its context is
/// safely saved before power is lost.
///
/// If the currently running task is itself durable it is suspended last,
/// after every other durable task. Each suspended task's run flag moves to
/// `Stopped`, which is what lets the next recovery pass resume it instead of
/// restarting it.
pub fn suspend_lengthy(
    fram: &mut Fram,
    memory: &TaskMemory,
    scheduler: &mut dyn Scheduler,
    current: TaskId,
) -> Result<()> {
    let tasks = memory.task_count();
    let mut suspend_current = false;

    for index in 0..tasks {
        #[allow(clippy::cast_possible_truncation)] // tasks validated <= u16::MAX
        let task = TaskId(index as u16);
        if memory.location(fram, task)? != StackLocation::Durable {
            continue;
        }
        if task == current {
            suspend_current = true;
            continue;
        }
        scheduler.suspend(task)?;
        memory.set_run_state(fram, task, RunState::Stopped)?;
        debug!(task = task.0, "suspended durable task");
    }

    if suspend_current {
        scheduler.suspend(current)?;
        memory.set_run_state(fram, current, RunState::Stopped)?;
        debug!(task = current.0, "suspended current durable task");
    }
    Ok(())
}
