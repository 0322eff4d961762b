#![forbid(unsafe_code)]
//! The object-facing store: multi-version durable objects with optimistic,
//! interval-based concurrency control.
//!
//! A task interacts with the store once per *attempt* — one
//! `register → read/compute → commit-or-abort` cycle:
//!
//! 1. [`Database::register`] opens the attempt with the full validity window
//!    `[0, MAX]` and a fresh control-block number.
//! 2. [`Database::read`] registers the attempt as a reader of the object and
//!    tightens the window's lower bound past the version it observed.
//! 3. [`Database::commit`] validates the window against the constraints
//!    writers have published since, and either durably publishes a new
//!    version through the two-slot commit map or aborts with
//!    [`EmberError::Conflict`] — in which case the caller discards the
//!    attempt and re-runs the task from scratch. There is no waiting.
//!
//! Validation uses coarse logical time instead of per-object locks: locks
//! are expensive to make crash-safe across arbitrary power loss, whereas
//! interval narrowing is idempotent and safely replayable.
//!
//! # Concurrency
//!
//! All controller state sits behind one `parking_lot::Mutex` — the single
//! critical section of the whole store: every operation
//! runs entirely inside one lock acquisition and the publish sequence
//! (slot write + bit flip) never straddles an unlock. Volatile state — the
//! write-set-reader table, reader sets, read caches, attempt windows — is
//! rebuilt empty after power loss; only what the image holds survives.

use ember_arena::{ArenaPools, Pool};
use ember_error::{EmberError, Result};
use ember_map::CommitMap;
use ember_nvm::{Fram, FramLayout, Header, WriteOp};
use ember_tasks::{
    recover, RecoveryReport, Scheduler, StackLocation, TaskMemory, TaskRegistry, TaskSpec,
};
use ember_types::{
    EntryPoint, LogicalTime, ObjectId, Priority, StoreGeometry, TaskId, TcbNumber,
    ValidityInterval,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Identity of one registered attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub task: TaskId,
    pub tcb: TcbNumber,
}

/// Task-private scratch a commit is staged in.
///
/// `object` is the id the buffer was acquired for; `None` means the commit
/// will create a new object.
#[derive(Debug, Clone)]
pub struct WorkingBuffer {
    task: TaskId,
    object: Option<ObjectId>,
    bytes: Vec<u8>,
}

impl WorkingBuffer {
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    #[must_use]
    pub fn object(&self) -> Option<ObjectId> {
        self.object
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptState {
    tcb: TcbNumber,
    interval: ValidityInterval,
}

/// One write-set-reader slot: "the earliest commit time that could
/// invalidate one of this attempt's reads is `begin`".
#[derive(Debug, Clone, Copy)]
struct WsrSlot {
    owner: Option<TcbNumber>,
    begin: LogicalTime,
}

struct Inner {
    fram: Fram,
    layout: FramLayout,
    map: CommitMap,
    arena: ArenaPools,
    registry: TaskRegistry,
    memory: TaskMemory,
    /// Attempt side table keyed by task id.
    attempts: Vec<Option<AttemptState>>,
    /// Fixed write-set-reader table, one slot per possible attempt.
    wsr: Vec<WsrSlot>,
    /// Per-object reader sets (attempt control-block numbers, deduplicated).
    readers: Vec<Vec<TcbNumber>>,
    /// Per-object read caches of the current committed bytes.
    caches: Vec<Option<Vec<u8>>>,
    next_tcb: u32,
}

/// The store. Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Database {
    inner: Mutex<Inner>,
}

impl Database {
    /// Cold-start a fresh image: every table formatted, nothing provisioned.
    pub fn format(geometry: StoreGeometry) -> Result<Self> {
        let layout = FramLayout::new(geometry)?;
        let mut fram = Fram::new(layout.total_len());

        let map = CommitMap::new(layout.clone());
        let arena = ArenaPools::new(layout.clone());
        let registry = TaskRegistry::new(layout.clone());
        let memory = TaskMemory::new(layout.clone());

        map.format(&mut fram)?;
        registry.format(&mut fram)?;
        memory.reset_all(&mut fram)?;
        arena.reset_all(&mut fram)?;
        fram.write_u32(layout.next_object_id_offset(), 0)?;
        fram.write_u32(layout.logical_time_offset(), 0)?;
        Header {
            provisioned: false,
            fail_count: 0,
        }
        .store(&mut fram)?;

        Ok(Self::assemble(fram, layout, map, arena, registry, memory))
    }

    /// Adopt an existing image (warm boot). The persisted regions are taken
    /// as-is; all volatile state starts empty.
    pub fn open(geometry: StoreGeometry, fram: Fram) -> Result<Self> {
        let layout = FramLayout::new(geometry)?;
        if fram.len() != layout.total_len() {
            return Err(EmberError::ImageCorrupt {
                detail: format!(
                    "image is {} bytes, geometry needs {}",
                    fram.len(),
                    layout.total_len()
                ),
            });
        }
        Header::load(&fram)?;

        let map = CommitMap::new(layout.clone());
        let arena = ArenaPools::new(layout.clone());
        let registry = TaskRegistry::new(layout.clone());
        let memory = TaskMemory::new(layout.clone());
        Ok(Self::assemble(fram, layout, map, arena, registry, memory))
    }

    fn assemble(
        fram: Fram,
        layout: FramLayout,
        map: CommitMap,
        arena: ArenaPools,
        registry: TaskRegistry,
        memory: TaskMemory,
    ) -> Self {
        let geometry = *layout.geometry();
        Self {
            inner: Mutex::new(Inner {
                fram,
                layout,
                map,
                arena,
                registry,
                memory,
                attempts: vec![None; geometry.tasks],
                wsr: vec![
                    WsrSlot {
                        owner: None,
                        begin: LogicalTime::MAX,
                    };
                    geometry.tasks
                ],
                readers: vec![Vec::new(); geometry.objects],
                caches: vec![None; geometry.objects],
                next_tcb: 0,
            }),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> StoreGeometry {
        *self.inner.lock().layout.geometry()
    }

    // ── Image lifecycle ─────────────────────────────────────────────────

    pub fn header(&self) -> Result<Header> {
        Header::load(&self.inner.lock().fram)
    }

    /// Mark the image as having completed a cold boot; the next boot with
    /// this image takes the recovery path.
    pub fn set_provisioned(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let mut header = Header::load(&inner.fram)?;
        header.provisioned = true;
        header.store(&mut inner.fram)
    }

    /// Count one survived power failure (warm boot).
    pub fn bump_fail_count(&self) -> Result<u32> {
        let inner = &mut *self.inner.lock();
        let mut header = Header::load(&inner.fram)?;
        header.fail_count += 1;
        header.store(&mut inner.fram)?;
        Ok(header.fail_count)
    }

    /// Bit-for-bit copy of the image, e.g. taken right before simulated
    /// power loss.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().fram.snapshot()
    }

    /// Enable or disable crash-injection write logging on the image.
    pub fn set_write_log(&self, enabled: bool) {
        self.inner.lock().fram.set_write_log(enabled);
    }

    pub fn take_write_log(&self) -> Vec<WriteOp> {
        self.inner.lock().fram.take_write_log()
    }

    // ── Logical time ────────────────────────────────────────────────────

    pub fn now(&self) -> Result<LogicalTime> {
        let inner = self.inner.lock();
        Ok(LogicalTime(
            inner.fram.read_u32(inner.layout.logical_time_offset())?,
        ))
    }

    /// Advance the persisted logical clock by one tick.
    ///
    /// The periodic tick is the single producer of time; it is delivered
    /// through this method, inside the critical section, never written from
    /// an interrupt context.
    pub fn tick(&self) -> Result<LogicalTime> {
        let inner = &mut *self.inner.lock();
        let offset = inner.layout.logical_time_offset();
        let next = LogicalTime(inner.fram.read_u32(offset)?).next();
        inner.fram.write_u32(offset, next.0)?;
        Ok(next)
    }

    // ── Attempt lifecycle (the concurrency controller) ──────────────────

    /// Open an attempt for `task`: full validity window, fresh control-block
    /// number, one write-set-reader slot claimed.
    pub fn register(&self, task: TaskId) -> Result<Attempt> {
        let inner = &mut *self.inner.lock();
        let index = check_task(&inner.layout, task)?;

        // A leftover attempt (e.g. the body never unregistered before
        // aborting) frees its slot first.
        if let Some(stale) = inner.attempts[index].take() {
            free_wsr(&mut inner.wsr, stale.tcb);
            trace!(task = task.0, "replaced stale attempt");
        }

        inner.next_tcb += 1;
        let tcb = TcbNumber(inner.next_tcb);

        let Some(index_free) = inner.wsr.iter().position(|slot| slot.owner.is_none()) else {
            return Err(EmberError::ControllerSlotsExhausted {
                tasks: inner.wsr.len(),
            });
        };
        inner.wsr[index_free] = WsrSlot {
            owner: Some(tcb),
            begin: LogicalTime::MAX,
        };

        inner.attempts[index] = Some(AttemptState {
            tcb,
            interval: ValidityInterval::FULL,
        });
        trace!(task = task.0, tcb = tcb.0, "attempt registered");
        Ok(Attempt { task, tcb })
    }

    /// Close an attempt, releasing its write-set-reader slot.
    pub fn unregister(&self, attempt: Attempt) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let index = check_task(&inner.layout, attempt.task)?;
        if let Some(state) = inner.attempts[index] {
            if state.tcb == attempt.tcb {
                inner.attempts[index] = None;
            }
        }
        free_wsr(&mut inner.wsr, attempt.tcb);
        Ok(())
    }

    /// The attempt's current validity window (diagnostic).
    pub fn attempt_interval(&self, attempt: Attempt) -> Result<ValidityInterval> {
        let inner = self.inner.lock();
        let index = check_task(&inner.layout, attempt.task)?;
        match inner.attempts[index] {
            Some(state) if state.tcb == attempt.tcb => Ok(state.interval),
            _ => Err(EmberError::NotRegistered { task: attempt.task.0 }),
        }
    }

    // ── Version store ───────────────────────────────────────────────────

    /// Acquire the task-private scratch a commit is staged in.
    ///
    /// `object` outside the configured table (or `None`) means the commit
    /// will create a new object.
    pub fn working_buffer(&self, attempt: Attempt, object: Option<ObjectId>) -> Result<WorkingBuffer> {
        let inner = self.inner.lock();
        let index = check_task(&inner.layout, attempt.task)?;
        require_attempt(&inner.attempts, index, attempt)?;

        let geometry = inner.layout.geometry();
        let object = object.filter(|id| geometry.contains_object(*id));
        Ok(WorkingBuffer {
            task: attempt.task,
            object,
            bytes: vec![0_u8; geometry.scratch_bytes],
        })
    }

    /// Read the current committed bytes of `object`, registering the attempt
    /// as a reader and tightening its window past the observed version.
    pub fn read(&self, attempt: Attempt, object: ObjectId) -> Result<Vec<u8>> {
        let inner = &mut *self.inner.lock();
        inner.read_registered(attempt, object)
    }

    /// Copy the object's current committed bytes into `dest`.
    ///
    /// `dest` must hold the object's recorded size; the number of bytes
    /// copied is returned.
    pub fn read_into(&self, attempt: Attempt, object: ObjectId, dest: &mut [u8]) -> Result<usize> {
        let inner = &mut *self.inner.lock();
        let bytes = inner.read_registered(attempt, object)?;
        if dest.len() < bytes.len() {
            return Err(EmberError::ReadBufferTooSmall {
                needed: bytes.len(),
                actual: dest.len(),
            });
        }
        dest[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Validate and durably publish `size` bytes from `work`.
    ///
    /// On success returns the object id (newly assigned for creations) with
    /// the commit already durable: the version published through the atomic
    /// map, the recorded size updated, the recreate counter cleared, and the
    /// task's registry entry marked durable-complete. On [`EmberError::Conflict`]
    /// nothing has changed; the caller must unregister, have the scheduler
    /// re-create the task from its entry point, and terminate this attempt.
    pub fn commit(&self, attempt: Attempt, work: &WorkingBuffer, size: usize) -> Result<ObjectId> {
        let inner = &mut *self.inner.lock();
        inner.commit(attempt, work, size)
    }

    /// Recorded size of an object's current version.
    pub fn object_size(&self, object: ObjectId) -> Result<usize> {
        let inner = self.inner.lock();
        check_object(&inner.layout, object)?;
        inner.map.current_size(&inner.fram, object)
    }

    /// Current committed bytes of `object` without touching the controller.
    ///
    /// Diagnostic: no reader registration, no interval narrowing. Intended
    /// for harness assertions and boot-time inspection.
    pub fn peek_object(&self, object: ObjectId) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        check_object(&inner.layout, object).map_err(|_| EmberError::ObjectNotFound {
            object: object.0,
        })?;
        let addr = inner.map.current_address(&inner.fram, object)?;
        if addr.is_none() {
            return Err(EmberError::ObjectNotFound { object: object.0 });
        }
        let size = inner.map.current_size(&inner.fram, object)?;
        Ok(inner.fram.read_bytes(addr.to_usize_checked()?, size)?.to_vec())
    }

    /// The interval stored with the object's current version (diagnostic).
    pub fn object_interval(&self, object: ObjectId) -> Result<ValidityInterval> {
        let inner = self.inner.lock();
        inner.map.current_interval(&inner.fram, object)
    }

    // ── Task lifecycle glue ─────────────────────────────────────────────

    /// Create a task through the scheduler, recording everything the next
    /// recovery pass needs.
    pub fn create_task(&self, scheduler: &mut dyn Scheduler, spec: &TaskSpec) -> Result<TcbNumber> {
        let inner = &mut *self.inner.lock();
        ember_tasks::create_and_track(
            &mut inner.fram,
            &inner.registry,
            &inner.memory,
            &inner.arena,
            scheduler,
            spec,
        )
    }

    /// Clear the registry entry of a normally-finished task instance.
    pub fn end_task(&self, tcb: TcbNumber) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.registry.end_task(&mut inner.fram, tcb)
    }

    /// [`Database::end_task`] for the idle task's reaping loop.
    pub fn end_task_from_idle(&self, tcb: TcbNumber) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.registry.end_task_from_idle(&mut inner.fram, tcb)
    }

    /// Clear every registry entry of `task` (used before re-creating it).
    pub fn clear_task_entries(&self, task: TaskId) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.registry.clear_unfinished_task(&mut inner.fram, task)
    }

    /// The persisted entry point and priority recorded for `task`.
    pub fn task_entry_point(&self, task: TaskId) -> Result<(EntryPoint, Priority)> {
        let inner = self.inner.lock();
        inner.memory.entry_point(&inner.fram, task)
    }

    /// Where `task`'s stack and control block currently live.
    pub fn task_location(&self, task: TaskId) -> Result<StackLocation> {
        let inner = self.inner.lock();
        inner.memory.location(&inner.fram, task)
    }

    /// Run the boot-time recovery pass and start the scheduler.
    ///
    /// Must only be called on a provisioned image, strictly before any task
    /// uses the store.
    pub fn recover(&self, scheduler: &mut dyn Scheduler) -> Result<RecoveryReport> {
        let inner = &mut *self.inner.lock();
        let mut report = recover(
            &mut inner.fram,
            &inner.registry,
            &inner.memory,
            &inner.arena,
            scheduler,
        )?;
        report.fail_count = Header::load(&inner.fram)?.fail_count;
        scheduler.start()?;
        Ok(report)
    }

    /// Low-voltage path: suspend every durable task so its context survives.
    pub fn suspend_lengthy(&self, scheduler: &mut dyn Scheduler, current: TaskId) -> Result<()> {
        let inner = &mut *self.inner.lock();
        ember_tasks::suspend_lengthy(&mut inner.fram, &inner.memory, scheduler, current)
    }
}

// ── Internals ───────────────────────────────────────────────────────────────

fn check_task(layout: &FramLayout, task: TaskId) -> Result<usize> {
    let tasks = layout.geometry().tasks;
    if usize::from(task.0) >= tasks {
        return Err(EmberError::TaskOutOfRange {
            task: task.0,
            limit: tasks,
        });
    }
    Ok(usize::from(task.0))
}

fn check_object(layout: &FramLayout, object: ObjectId) -> Result<usize> {
    let objects = layout.geometry().objects;
    if usize::from(object.0) >= objects {
        return Err(EmberError::ObjectOutOfRange {
            object: object.0,
            limit: objects,
        });
    }
    Ok(usize::from(object.0))
}

fn require_attempt(
    attempts: &[Option<AttemptState>],
    index: usize,
    attempt: Attempt,
) -> Result<()> {
    match attempts[index] {
        Some(state) if state.tcb == attempt.tcb => Ok(()),
        _ => Err(EmberError::NotRegistered { task: attempt.task.0 }),
    }
}

fn free_wsr(wsr: &mut [WsrSlot], tcb: TcbNumber) {
    for slot in wsr {
        if slot.owner == Some(tcb) {
            slot.owner = None;
            slot.begin = LogicalTime::MAX;
            return;
        }
    }
}

trait NvAddrExt {
    fn to_usize_checked(self) -> Result<usize>;
}

impl NvAddrExt for ember_types::NvAddr {
    fn to_usize_checked(self) -> Result<usize> {
        self.to_usize()
            .map_err(|e| EmberError::InvalidGeometry(e.to_string()))
    }
}

impl Inner {
    fn read_registered(&mut self, attempt: Attempt, object: ObjectId) -> Result<Vec<u8>> {
        let task_index = check_task(&self.layout, attempt.task)?;
        require_attempt(&self.attempts, task_index, attempt)?;

        let object_index = check_object(&self.layout, object).map_err(|_| {
            EmberError::ObjectNotFound { object: object.0 }
        })?;
        // Existence is decided by the map, not the size: a zero-length
        // commit is a real (empty) object.
        let addr = self.map.current_address(&self.fram, object)?;
        if addr.is_none() {
            return Err(EmberError::ObjectNotFound { object: object.0 });
        }
        let size = self.map.current_size(&self.fram, object)?;

        // Record the read dependency: dedup by control-block number, drop
        // (with a warning) when the reader set is full. A dropped dependency
        // only widens the chance of a later abort; it never breaks safety.
        let readers = &mut self.readers[object_index];
        if !readers.contains(&attempt.tcb) {
            if readers.len() < self.layout.geometry().max_readers {
                readers.push(attempt.tcb);
            } else {
                warn!(
                    object = object.0,
                    task = attempt.task.0,
                    "reader set full; read dependency dropped"
                );
            }
        }

        // The read is only consistent after the observed version began.
        let begin = self.map.current_begin(&self.fram, object)?;
        if let Some(state) = self.attempts[task_index].as_mut() {
            state.interval.narrow_begin(LogicalTime(begin.0.saturating_add(1)));
        }

        if let Some(cache) = &self.caches[object_index] {
            return Ok(cache.clone());
        }
        Ok(self.fram.read_bytes(addr.to_usize_checked()?, size)?.to_vec())
    }

    fn commit(&mut self, attempt: Attempt, work: &WorkingBuffer, size: usize) -> Result<ObjectId> {
        let task_index = check_task(&self.layout, attempt.task)?;
        require_attempt(&self.attempts, task_index, attempt)?;
        if size > work.bytes.len() {
            return Err(EmberError::ReadBufferTooSmall {
                needed: size,
                actual: work.bytes.len(),
            });
        }
        let creation = work.object.is_none();
        if let Some(id) = work.object {
            check_object(&self.layout, id)?;
        }

        // ── Validation, entirely inside the critical section ────────────
        let mut interval = match self.attempts[task_index] {
            Some(state) => state.interval,
            None => return Err(EmberError::NotRegistered { task: attempt.task.0 }),
        };

        // 1. Consume the constraint writers left for this attempt's reads.
        for slot in &mut self.wsr {
            if slot.owner == Some(attempt.tcb) {
                if slot.begin != LogicalTime::MAX {
                    interval.narrow_end(LogicalTime(slot.begin.0.saturating_sub(1)));
                    slot.begin = LogicalTime::MAX;
                }
                break;
            }
        }

        // 2. An update must start after the version it supersedes began.
        if let Some(id) = work.object {
            let begin = self.map.current_begin(&self.fram, id)?;
            interval.narrow_begin(LogicalTime(begin.0.saturating_add(1)));
        }

        // 3. A commit cannot be valid later than "now".
        let now = LogicalTime(self.fram.read_u32(self.layout.logical_time_offset())?);
        interval.narrow_end(now);

        // Persist the narrowed window back into the attempt either way.
        if let Some(state) = self.attempts[task_index].as_mut() {
            state.interval = interval;
        }

        // 4. Window closed: abort, nothing published.
        if !interval.is_valid() {
            debug!(
                task = attempt.task.0,
                %interval,
                "commit validation failed"
            );
            return Err(EmberError::Conflict {
                task: attempt.task.0,
                begin: interval.begin.0,
                end: interval.end.0,
            });
        }

        // 5. Publish.
        let id = match work.object {
            Some(id) => id,
            None => {
                let next = self.fram.read_u32(self.layout.next_object_id_offset())?;
                let objects = self.layout.geometry().objects;
                if usize::try_from(next).unwrap_or(usize::MAX) >= objects {
                    return Err(EmberError::ObjectTableFull { limit: objects });
                }
                self.fram
                    .write_u32(self.layout.next_object_id_offset(), next + 1)?;
                #[allow(clippy::cast_possible_truncation)] // objects validated <= u16::MAX
                let id = ObjectId(next as u16);
                id
            }
        };
        let object_index = usize::from(id.0);

        let addr = self
            .arena
            .allocate(&mut self.fram, Pool::Data, attempt.task, size)?;
        self.fram
            .write_bytes(addr.to_usize_checked()?, &work.bytes[..size])?;
        self.map.publish(&mut self.fram, id, addr, interval, size)?;

        // The version is durable from here on.
        self.registry.mark_commit(&mut self.fram, attempt.task)?;
        self.registry
            .clear_unfinished_task(&mut self.fram, attempt.task)?;
        self.caches[object_index] = Some(work.bytes[..size].to_vec());

        // The superseded version's bytes stay in the writer's data pool
        // until wraparound overwrites them; bump pools have no free.

        // Tell every registered reader of this object that its snapshot may
        // be invalidated from `interval.begin` on.
        let readers = std::mem::take(&mut self.readers[object_index]);
        for reader in readers {
            if reader == attempt.tcb {
                continue;
            }
            for slot in &mut self.wsr {
                if slot.owner == Some(reader) {
                    if interval.begin < slot.begin {
                        slot.begin = interval.begin;
                    }
                    break;
                }
            }
        }

        debug!(
            task = attempt.task.0,
            object = id.0,
            size,
            %interval,
            creation,
            "commit published"
        );
        Ok(id)
    }
}
