#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a versioned object in the store (`0..geometry.objects`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u16);

/// Logical task identifier (`0..geometry.tasks`), stable across re-creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u16);

/// Scheduler-assigned control-block number, unique per task *instance*.
///
/// A logical task that aborts and is re-created receives a fresh number, so
/// reader sets and write-set-reader slots left behind by a dead attempt never
/// match a live one. Numbers are volatile and restart from zero after a
/// power cycle, together with every table that stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TcbNumber(pub u32);

/// Byte offset into the non-volatile image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NvAddr(pub u32);

impl NvAddr {
    /// Sentinel for "no address stored" (a slot that has never been published).
    pub const NONE: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Narrow to `usize` for indexing into the image.
    pub fn to_usize(self) -> Result<usize, GeometryError> {
        usize::try_from(self.0).map_err(|_| GeometryError::IntegerConversion { field: "nv_addr" })
    }
}

/// Persisted token identifying a task entry point.
///
/// The scheduler owns the mapping from token to executable code; the core
/// only stores and replays tokens. A raw function pointer could not be
/// persisted meaningfully — it would dangle after a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryPoint(pub u32);

/// Scheduler priority (0 is lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u16);

// ── Logical time ────────────────────────────────────────────────────────────

/// A point in the tick-driven logical time domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalTime(pub u32);

impl LogicalTime {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u32::MAX);

    /// Next tick, saturating at the top of the domain.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// A task's validity window `[begin, end]` in logical time.
///
/// `begin` only ever grows and `end` only ever shrinks over the lifetime of
/// one attempt; once they cross, the attempt's view of the store is no
/// longer serializable and it must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub begin: LogicalTime,
    pub end: LogicalTime,
}

impl ValidityInterval {
    /// The unconstrained window a fresh attempt starts with.
    pub const FULL: Self = Self {
        begin: LogicalTime::ZERO,
        end: LogicalTime::MAX,
    };

    #[must_use]
    pub fn new(begin: LogicalTime, end: LogicalTime) -> Self {
        Self { begin, end }
    }

    /// Whether the window still admits at least one commit time.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.begin <= self.end
    }

    /// Tighten the lower bound. `begin` never decreases.
    pub fn narrow_begin(&mut self, at_least: LogicalTime) {
        if at_least > self.begin {
            self.begin = at_least;
        }
    }

    /// Tighten the upper bound. `end` never increases.
    pub fn narrow_end(&mut self, at_most: LogicalTime) {
        if at_most < self.end {
            self.end = at_most;
        }
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Validated store geometry: every table and pool size the image layout is
/// derived from.
///
/// The defaults (16 objects, 12 tasks, 8 readers per object) fit a small
/// sensing deployment. All sizes are fixed at provisioning time; the image
/// layout never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreGeometry {
    /// Number of object slots (`ObjectId` range).
    pub objects: usize,
    /// Number of task slots (`TaskId` range), registry size, pool count.
    pub tasks: usize,
    /// Reader-set capacity per object.
    pub max_readers: usize,
    /// Per-task heap-like pool capacity in bytes.
    pub heap_pool_bytes: usize,
    /// Per-task data-like pool capacity in bytes (backs committed versions).
    pub data_pool_bytes: usize,
    /// Per-task persisted stack region in bytes.
    pub stack_bytes: usize,
    /// Per-task persisted control-block region in bytes.
    pub tcb_bytes: usize,
    /// Working-buffer size handed to tasks, in bytes.
    pub scratch_bytes: usize,
}

impl Default for StoreGeometry {
    fn default() -> Self {
        Self {
            objects: 16,
            tasks: 12,
            max_readers: 8,
            heap_pool_bytes: 64,
            data_pool_bytes: 256,
            stack_bytes: 512,
            tcb_bytes: 128,
            scratch_bytes: 64,
        }
    }
}

impl StoreGeometry {
    /// Validate the configuration.
    ///
    /// Object and task counts must fit their id types, every table needs at
    /// least one slot, and the data pool must be able to hold at least one
    /// full working buffer (a max-size commit).
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.objects == 0 || self.objects > usize::from(u16::MAX) {
            return Err(GeometryError::InvalidField {
                field: "objects",
                reason: "must be in 1..=65535",
            });
        }
        if self.tasks == 0 || self.tasks > usize::from(u16::MAX) {
            return Err(GeometryError::InvalidField {
                field: "tasks",
                reason: "must be in 1..=65535",
            });
        }
        if self.max_readers == 0 {
            return Err(GeometryError::InvalidField {
                field: "max_readers",
                reason: "must be at least 1",
            });
        }
        if self.scratch_bytes == 0 {
            return Err(GeometryError::InvalidField {
                field: "scratch_bytes",
                reason: "must be at least 1",
            });
        }
        if self.data_pool_bytes < self.scratch_bytes {
            return Err(GeometryError::InvalidField {
                field: "data_pool_bytes",
                reason: "must hold at least one working buffer",
            });
        }
        Ok(())
    }

    /// Whether `id` names a slot inside this geometry.
    #[must_use]
    pub fn contains_object(&self, id: ObjectId) -> bool {
        usize::from(id.0) < self.objects
    }

    /// Whether `task` names a slot inside this geometry.
    #[must_use]
    pub fn contains_task(&self, task: TaskId) -> bool {
        usize::from(task.0) < self.tasks
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian byte helpers ──────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], GeometryError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(GeometryError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(GeometryError::InvalidField {
            field: "offset",
            reason: "out of bounds",
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, GeometryError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, GeometryError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

// ── Display impls ───────────────────────────────────────────────────────────

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TcbNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NvAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ValidityInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}
