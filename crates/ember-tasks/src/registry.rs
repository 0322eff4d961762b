//! The persisted recovery registry.
//!
//! A fixed table of `tasks` entries, each 18 bytes:
//!
//! ```text
//! +-----------+--------+
//! | entry     | 4 bytes| entry-point token
//! | priority  | 2 bytes|
//! | tcb_num   | 4 bytes| control-block number of the live instance
//! | tcb_addr  | 4 bytes| persisted TCB region (durable tasks only)
//! | owned     | 1 byte | scheduler-owned flag
//! | task      | 2 bytes| logical task id
//! | unfinished| 1 byte | 1 = in flight; anything else = free slot
//! +-----------+--------+
//! ```
//!
//! The `unfinished` byte is written last when arming an entry, so a crash in
//! the middle of `begin_task` leaves a free slot rather than a half-described
//! task.

use ember_error::{EmberError, Result};
use ember_nvm::Fram;
use ember_nvm::FramLayout;
use ember_types::{EntryPoint, NvAddr, Priority, TaskId, TcbNumber};
use tracing::trace;

/// One decoded registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub entry: EntryPoint,
    pub priority: Priority,
    pub tcb_num: TcbNumber,
    pub tcb_addr: NvAddr,
    pub scheduler_owned: bool,
    pub task: TaskId,
    pub unfinished: bool,
}

/// The registry over one image layout.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    layout: FramLayout,
}

impl TaskRegistry {
    #[must_use]
    pub fn new(layout: FramLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.layout.geometry().tasks
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

    /// Clear every entry and zero every recreate counter. Cold start only.
    pub fn format(&self, fram: &mut Fram) -> Result<()> {
        for slot in 0..self.slot_count() {
            self.clear_slot(fram, slot)?;
        }
        self.reset_counters(fram)
    }

    /// Record an in-flight task in the first free slot, flag written last.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_task(
        &self,
        fram: &mut Fram,
        entry: EntryPoint,
        priority: Priority,
        tcb_num: TcbNumber,
        tcb_addr: NvAddr,
        scheduler_owned: bool,
        task: TaskId,
    ) -> Result<usize> {
        self.check_task(task)?;
        for slot in 0..self.slot_count() {
            let offset = self.layout.registry_entry_offset(slot);
            if fram.read_u8(offset + 17)? == 1 {
                continue;
            }
            fram.write_u32(offset, entry.0)?;
            fram.write_u16(offset + 4, priority.0)?;
            fram.write_u32(offset + 6, tcb_num.0)?;
            fram.write_u32(offset + 10, tcb_addr.0)?;
            fram.write_u8(offset + 14, u8::from(scheduler_owned))?;
            fram.write_u16(offset + 15, task.0)?;
            fram.write_u8(offset + 17, 1)?;
            trace!(slot, task = task.0, tcb = tcb_num.0, "task registered");
            return Ok(slot);
        }
        Err(EmberError::RegistrySlotsExhausted {
            tasks: self.slot_count(),
        })
    }

    /// Clear the entry matching `tcb_num` (normal completion). Quiet no-op
    /// when nothing matches — the entry may already have been cleared by a
    /// durable commit.
    pub fn end_task(&self, fram: &mut Fram, tcb_num: TcbNumber) -> Result<()> {
        for slot in 0..self.slot_count() {
            let offset = self.layout.registry_entry_offset(slot);
            if fram.read_u8(offset + 17)? == 1 && fram.read_u32(offset + 6)? == tcb_num.0 {
                fram.write_u8(offset + 17, 0)?;
                trace!(slot, tcb = tcb_num.0, "task ended");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Same as [`TaskRegistry::end_task`], for use by the lowest-priority
    /// always-runnable unit reaping finished tasks. The caller constraint is
    /// documented, not enforced.
    pub fn end_task_from_idle(&self, fram: &mut Fram, tcb_num: TcbNumber) -> Result<()> {
        self.end_task(fram, tcb_num)
    }

    /// Clear every armed entry belonging to `task`.
    ///
    /// A durable commit calls this: the task's work is now persistent, so it
    /// must not be resumed or re-created by the next recovery pass.
    pub fn clear_unfinished_task(&self, fram: &mut Fram, task: TaskId) -> Result<()> {
        self.check_task(task)?;
        for slot in 0..self.slot_count() {
            let offset = self.layout.registry_entry_offset(slot);
            if fram.read_u8(offset + 17)? == 1 && fram.read_u16(offset + 15)? == task.0 {
                fram.write_u8(offset + 17, 0)?;
                trace!(slot, task = task.0, "task marked durable-complete");
            }
        }
        Ok(())
    }

    /// Decode one slot.
    pub fn entry(&self, fram: &Fram, slot: usize) -> Result<RegistryEntry> {
        let offset = self.layout.registry_entry_offset(slot);
        Ok(RegistryEntry {
            entry: EntryPoint(fram.read_u32(offset)?),
            priority: Priority(fram.read_u16(offset + 4)?),
            tcb_num: TcbNumber(fram.read_u32(offset + 6)?),
            tcb_addr: NvAddr(fram.read_u32(offset + 10)?),
            scheduler_owned: fram.read_u8(offset + 14)? != 0,
            task: TaskId(fram.read_u16(offset + 15)?),
            unfinished: fram.read_u8(offset + 17)? == 1,
        })
    }

    /// All armed (unfinished) entries with their slot indices.
    pub fn unfinished_entries(&self, fram: &Fram) -> Result<Vec<(usize, RegistryEntry)>> {
        let mut out = Vec::new();
        for slot in 0..self.slot_count() {
            let entry = self.entry(fram, slot)?;
            if entry.unfinished {
                out.push((slot, entry));
            }
        }
        Ok(out)
    }

    /// Mark one slot free.
    pub fn clear_slot(&self, fram: &mut Fram, slot: usize) -> Result<()> {
        let offset = self.layout.registry_entry_offset(slot);
        fram.write_u8(offset + 17, 0)
    }

    // ── Recreate counters ───────────────────────────────────────────────

    /// Consecutive times this task was re-created from scratch by recovery.
    pub fn recreate_count(&self, fram: &Fram, task: TaskId) -> Result<u16> {
        let index = self.check_task(task)?;
        fram.read_u16(self.layout.recreate_offset(index))
    }

    pub fn bump_recreate(&self, fram: &mut Fram, task: TaskId) -> Result<u16> {
        let index = self.check_task(task)?;
        let offset = self.layout.recreate_offset(index);
        let next = fram.read_u16(offset)?.saturating_add(1);
        fram.write_u16(offset, next)?;
        Ok(next)
    }

    /// A durable commit landed: the task made forward progress, so the
    /// escalation counter starts over.
    pub fn mark_commit(&self, fram: &mut Fram, task: TaskId) -> Result<()> {
        let index = self.check_task(task)?;
        fram.write_u16(self.layout.recreate_offset(index), 0)
    }

    /// Zero every recreate counter. Cold start only.
    pub fn reset_counters(&self, fram: &mut Fram) -> Result<()> {
        for task in 0..self.slot_count() {
            fram.write_u16(self.layout.recreate_offset(task), 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::StoreGeometry;

    fn setup() -> (TaskRegistry, Fram) {
        let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
        let mut fram = Fram::new(layout.total_len());
        let registry = TaskRegistry::new(layout);
        registry.format(&mut fram).expect("format");
        (registry, fram)
    }

    fn arm(registry: &TaskRegistry, fram: &mut Fram, task: u16, tcb: u32) -> usize {
        registry
            .begin_task(
                fram,
                EntryPoint(100 + u32::from(task)),
                Priority(1),
                TcbNumber(tcb),
                NvAddr::NONE,
                false,
                TaskId(task),
            )
            .expect("begin")
    }

    #[test]
    fn begin_end_round_trip() {
        let (registry, mut fram) = setup();
        let slot = arm(&registry, &mut fram, 3, 41);
        let entry = registry.entry(&fram, slot).expect("entry");
        assert!(entry.unfinished);
        assert_eq!(entry.task, TaskId(3));
        assert_eq!(entry.tcb_num, TcbNumber(41));
        assert_eq!(entry.entry, EntryPoint(103));

        registry.end_task(&mut fram, TcbNumber(41)).expect("end");
        assert!(!registry.entry(&fram, slot).expect("entry").unfinished);
        assert!(registry.unfinished_entries(&fram).expect("list").is_empty());
    }

    #[test]
    fn end_task_is_quiet_when_absent() {
        let (registry, mut fram) = setup();
        registry.end_task(&mut fram, TcbNumber(999)).expect("end");
        registry
            .end_task_from_idle(&mut fram, TcbNumber(999))
            .expect("end");
    }

    #[test]
    fn slots_fill_first_free() {
        let (registry, mut fram) = setup();
        let a = arm(&registry, &mut fram, 0, 1);
        let b = arm(&registry, &mut fram, 1, 2);
        assert_eq!((a, b), (0, 1));

        registry.end_task(&mut fram, TcbNumber(1)).expect("end");
        let c = arm(&registry, &mut fram, 2, 3);
        assert_eq!(c, 0);
    }

    #[test]
    fn exhaustion_is_typed() {
        let (registry, mut fram) = setup();
        for task in 0..12_u16 {
            arm(&registry, &mut fram, task, u32::from(task));
        }
        let result = registry.begin_task(
            &mut fram,
            EntryPoint(0),
            Priority(0),
            TcbNumber(100),
            NvAddr::NONE,
            false,
            TaskId(0),
        );
        assert!(matches!(
            result,
            Err(EmberError::RegistrySlotsExhausted { tasks: 12 })
        ));
    }

    #[test]
    fn recreate_counter_lifecycle() {
        let (registry, mut fram) = setup();
        let task = TaskId(5);
        assert_eq!(registry.recreate_count(&fram, task).expect("count"), 0);
        assert_eq!(registry.bump_recreate(&mut fram, task).expect("bump"), 1);
        assert_eq!(registry.bump_recreate(&mut fram, task).expect("bump"), 2);
        registry.mark_commit(&mut fram, task).expect("commit");
        assert_eq!(registry.recreate_count(&fram, task).expect("count"), 0);
    }

    #[test]
    fn unfinished_flag_is_written_last() {
        let (registry, mut fram) = setup();
        fram.set_write_log(true);
        arm(&registry, &mut fram, 0, 7);
        let ops = fram.take_write_log();
        // Replaying all but the final one-byte flag write leaves the slot free.
        let mut image = {
            let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
            let blank = Fram::new(layout.total_len());
            blank.snapshot()
        };
        let total = ember_nvm::ops_total_bytes(&ops);
        ember_nvm::apply_ops_prefix(&mut image, &ops, total - 1);
        let crashed = Fram::from_bytes(image);
        assert!(registry.unfinished_entries(&crashed).expect("list").is_empty());
    }
}
