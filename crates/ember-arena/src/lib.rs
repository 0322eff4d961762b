#![forbid(unsafe_code)]
//! Per-task non-volatile allocation.
//!
//! Each task owns four fixed regions inside the FRAM image: a heap-like bump
//! pool, a data-like bump pool (committed object versions are carved from
//! it), a persisted stack region, and a persisted control-block region.
//!
//! The pools are plain bump allocators whose running indices are themselves
//! persisted. An allocation that would run past the end of a pool resets the
//! index to zero first and overwrites from the start — there is no free list
//! and no reclamation ordering guarantee. Sizing the pools so that live data
//! is never overwritten is a configuration responsibility.

use ember_error::{EmberError, Result};
use ember_nvm::{Fram, FramLayout};
use ember_types::{NvAddr, TaskId};
use tracing::warn;

/// Which bump pool an allocation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Scratch allocations a task makes while computing.
    Heap,
    /// Durable allocations that outlive the task (committed versions).
    Data,
}

/// Allocator over the per-task regions of one image layout.
#[derive(Debug, Clone)]
pub struct ArenaPools {
    layout: FramLayout,
}

impl ArenaPools {
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

    fn pool_params(&self, pool: Pool, task: usize) -> (usize, usize, usize) {
        match pool {
            Pool::Heap => (
                self.layout.heap_index_offset(task),
                self.layout.heap_pool_offset(task),
                self.layout.geometry().heap_pool_bytes,
            ),
            Pool::Data => (
                self.layout.data_index_offset(task),
                self.layout.data_pool_offset(task),
                self.layout.geometry().data_pool_bytes,
            ),
        }
    }

    /// Bump-allocate `size` bytes from `task`'s pool.
    ///
    /// If the running index plus `size` would exceed the pool's capacity the
    /// index resets to zero first; addresses returned before the wrap are
    /// overwritten. `size` larger than the whole pool cannot be satisfied at
    /// all and is a typed error.
    pub fn allocate(&self, fram: &mut Fram, pool: Pool, task: TaskId, size: usize) -> Result<NvAddr> {
        let index_of = self.check_task(task)?;
        let (index_offset, pool_offset, capacity) = self.pool_params(pool, index_of);

        if size > capacity {
            return Err(EmberError::AllocationTooLarge {
                requested: size,
                capacity,
            });
        }

        let mut index = usize::try_from(fram.read_u32(index_offset)?)
            .map_err(|_| EmberError::LayoutOverflow { region: "pool index" })?;
        if index + size > capacity {
            warn!(task = task.0, ?pool, index, size, "pool wraparound");
            index = 0;
        }

        let addr = pool_offset + index;
        let next = u32::try_from(index + size)
            .map_err(|_| EmberError::LayoutOverflow { region: "pool index" })?;
        fram.write_u32(index_offset, next)?;

        let addr = u32::try_from(addr).map_err(|_| EmberError::LayoutOverflow { region: "pool" })?;
        Ok(NvAddr(addr))
    }

    /// Current bump index of `task`'s pool (diagnostic).
    pub fn pool_index(&self, fram: &Fram, pool: Pool, task: TaskId) -> Result<usize> {
        let index_of = self.check_task(task)?;
        let (index_offset, _, _) = self.pool_params(pool, index_of);
        usize::try_from(fram.read_u32(index_offset)?)
            .map_err(|_| EmberError::LayoutOverflow { region: "pool index" })
    }

    /// Start of `task`'s persisted stack region.
    pub fn stack_region(&self, task: TaskId) -> Result<NvAddr> {
        let index_of = self.check_task(task)?;
        let addr = u32::try_from(self.layout.stack_offset(index_of))
            .map_err(|_| EmberError::LayoutOverflow { region: "stack" })?;
        Ok(NvAddr(addr))
    }

    /// Start of `task`'s persisted control-block region.
    pub fn tcb_region(&self, task: TaskId) -> Result<NvAddr> {
        let index_of = self.check_task(task)?;
        let addr = u32::try_from(self.layout.tcb_offset(index_of))
            .map_err(|_| EmberError::LayoutOverflow { region: "tcb" })?;
        Ok(NvAddr(addr))
    }

    /// Zero both bump indices for one task.
    ///
    /// Cold start only: recovery must never call this, because the pools hold
    /// the committed versions and the persisted stacks it is about to resume.
    pub fn reset_task(&self, fram: &mut Fram, task: TaskId) -> Result<()> {
        let index_of = self.check_task(task)?;
        fram.write_u32(self.layout.heap_index_offset(index_of), 0)?;
        fram.write_u32(self.layout.data_index_offset(index_of), 0)
    }

    /// Zero every task's bump indices (cold start only).
    pub fn reset_all(&self, fram: &mut Fram) -> Result<()> {
        for task in 0..self.layout.geometry().tasks {
            #[allow(clippy::cast_possible_truncation)] // tasks validated <= u16::MAX
            self.reset_task(fram, TaskId(task as u16))?;
        }
        Ok(())
    }
}
