//! Boot-time recovery of the in-flight task set.
//!
//! Runs exactly once after an unclean shutdown, strictly before the
//! scheduler starts; nothing else touches the registry or the task flags
//! while it runs.
//!
//! The pass walks two sources of truth: the per-task location/run flags
//! (which durable tasks existed and whether their context was saved) and the
//! registry (which tasks were in flight). Decisions, in order:
//!
//! 1. Durable tasks with a saved context are resumed; durable tasks that
//!    were mid-run are re-created fresh in durable storage (the saved
//!    context cannot be trusted).
//! 2. In-flight volatile tasks whose recreate counter reached the threshold
//!    are promoted to durable handling — a task that keeps straddling
//!    outages is cheaper to resume than to restart forever.
//! 3. Every remaining in-flight volatile task is re-created from scratch in
//!    volatile storage, with its recreate counter bumped.
//! 4. The caller starts the scheduler.
//!
//! Entries belonging to a durable task are resolved by step 1 (resuming or
//! re-creating that instance covers them); steps 2 and 3 only consider
//! volatile tasks. Entries are deduplicated by task id before any mutation,
//! so re-running the pass — for instance after losing power during recovery
//! itself — reconstructs the same task set with no duplicates.

use crate::{
    create_and_track, RunState, Scheduler, StackLocation, TaskMemory, TaskRegistry, TaskSpec,
};
use ember_arena::ArenaPools;
use ember_error::Result;
use ember_nvm::Fram;
use ember_types::TaskId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Consecutive failed re-creations after which a task is promoted to
/// durable ("lengthy") handling.
pub const PROMOTE_THRESHOLD: u16 = 1;

/// What one recovery pass did, for the boot log and the harness reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Durable tasks resumed from their persisted context.
    pub resumed: Vec<u16>,
    /// Durable tasks re-created because they were mid-run at power loss.
    pub recreated_durable: Vec<u16>,
    /// Volatile tasks promoted to durable handling this pass.
    pub promoted: Vec<u16>,
    /// Volatile tasks re-created from scratch.
    pub recreated_volatile: Vec<u16>,
    /// Times a durable task's saved context could not be used.
    pub lengthy_failures: u32,
    /// Power failures survived so far (from the image header).
    pub fail_count: u32,
}

impl RecoveryReport {
    /// Logical ids of every task the pass left running, sorted.
    #[must_use]
    pub fn active_tasks(&self) -> Vec<u16> {
        let mut all: Vec<u16> = self
            .resumed
            .iter()
            .chain(&self.recreated_durable)
            .chain(&self.promoted)
            .chain(&self.recreated_volatile)
            .copied()
            .collect();
        all.sort_unstable();
        all
    }
}

/// Run the recovery pass. The caller is responsible for starting the
/// scheduler afterwards (step 4) and for only invoking this on a
/// provisioned image.
pub fn recover(
    fram: &mut Fram,
    registry: &TaskRegistry,
    memory: &TaskMemory,
    arena: &ArenaPools,
    scheduler: &mut dyn Scheduler,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    // Snapshot the in-flight entries before anything mutates the registry:
    // tasks created below arm fresh entries that must not be re-processed.
    let mut pending = registry.unfinished_entries(fram)?;

    // Dedup by task id; a crash between re-creating a task and clearing its
    // old entry can leave two entries for the same task.
    let mut seen = vec![false; memory.task_count()];
    pending.retain(|(slot, entry)| {
        let index = usize::from(entry.task.0);
        if index >= seen.len() || seen[index] {
            let _ = registry.clear_slot(fram, *slot);
            return false;
        }
        seen[index] = true;
        true
    });

    // Step 1: durable tasks — resume saved contexts, re-create the rest.
    for index in 0..memory.task_count() {
        #[allow(clippy::cast_possible_truncation)] // tasks validated <= u16::MAX
        let task = TaskId(index as u16);
        if memory.location(fram, task)? != StackLocation::Durable {
            continue;
        }

        if memory.run_state(fram, task)? == RunState::Stopped {
            scheduler.resume_persisted(task, arena.tcb_region(task)?)?;
            report.resumed.push(task.0);
            debug!(task = task.0, "resumed durable task");
        } else {
            // Mid-run at power loss: the saved context cannot be trusted.
            let (entry, priority) = memory.entry_point(fram, task)?;
            report.lengthy_failures += 1;
            for (slot, pending_entry) in &pending {
                if pending_entry.task == task {
                    registry.clear_slot(fram, *slot)?;
                }
            }
            create_and_track(
                fram,
                registry,
                memory,
                arena,
                scheduler,
                &TaskSpec {
                    entry,
                    name: "recovered lengthy task",
                    stack_bytes: 0,
                    priority,
                    task,
                    location: StackLocation::Durable,
                    scheduler_owned: false,
                },
            )?;
            report.recreated_durable.push(task.0);
            debug!(task = task.0, "re-created durable task");
        }
        // Either way the durable instance covers this task's registry state.
        pending.retain(|(_, pending_entry)| pending_entry.task != task);
    }

    // Step 2: promote repeat offenders to durable handling.
    let mut still_pending = Vec::with_capacity(pending.len());
    for (slot, entry) in pending {
        if entry.scheduler_owned {
            still_pending.push((slot, entry));
            continue;
        }
        if registry.recreate_count(fram, entry.task)? < PROMOTE_THRESHOLD {
            still_pending.push((slot, entry));
            continue;
        }
        create_and_track(
            fram,
            registry,
            memory,
            arena,
            scheduler,
            &TaskSpec {
                entry: entry.entry,
                name: "recovered lengthy task",
                stack_bytes: 0,
                priority: entry.priority,
                task: entry.task,
                location: StackLocation::Durable,
                scheduler_owned: false,
            },
        )?;
        registry.clear_slot(fram, slot)?;
        report.promoted.push(entry.task.0);
        info!(task = entry.task.0, "promoted task to durable handling");
    }

    // Step 3: everything else restarts from scratch in volatile storage.
    // The replacement entry is armed before the old one clears; a crash in
    // between leaves a duplicate for the dedup above, never a lost task.
    for (slot, entry) in still_pending {
        if entry.scheduler_owned {
            // The scheduler re-creates its own tasks.
            registry.clear_slot(fram, slot)?;
            continue;
        }
        registry.bump_recreate(fram, entry.task)?;
        create_and_track(
            fram,
            registry,
            memory,
            arena,
            scheduler,
            &TaskSpec {
                entry: entry.entry,
                name: "recovered task",
                stack_bytes: 0,
                priority: entry.priority,
                task: entry.task,
                location: StackLocation::Volatile,
                scheduler_owned: false,
            },
        )?;
        registry.clear_slot(fram, slot)?;
        report.recreated_volatile.push(entry.task.0);
        debug!(task = entry.task.0, "re-created volatile task");
    }

    info!(
        resumed = report.resumed.len(),
        recreated_durable = report.recreated_durable.len(),
        promoted = report.promoted.len(),
        recreated_volatile = report.recreated_volatile.len(),
        "recovery pass complete"
    );
    Ok(report)
}
