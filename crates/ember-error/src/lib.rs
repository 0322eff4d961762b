#![forbid(unsafe_code)]
//! Error types for Ember.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Meaning |
//! |-------|----------|---------|
//! | Validation abort | `Conflict` | Expected, non-fatal: the attempt's validity window closed. Resolved by discarding the attempt and re-running the task. |
//! | Range / not-found | `ObjectNotFound`, `ObjectOutOfRange`, `TaskOutOfRange`, `NotRegistered` | Caller error or legitimate "never committed" state. |
//! | Capacity exhaustion | `ControllerSlotsExhausted`, `RegistrySlotsExhausted`, `ObjectTableFull`, `AllocationTooLarge`, `ReadBufferTooSmall` | Configuration errors: the geometry must be sized for the worst case. Surfaced as typed failures so a mis-sized configuration fails loudly. |
//! | Image integrity | `ImageTruncated`, `ImageCorrupt`, `LayoutOverflow`, `InvalidGeometry` | The non-volatile image cannot be trusted or laid out. |
//! | I/O | `Io` | Host filesystem failures while loading/saving an image. |
//!
//! Power loss is deliberately absent: it is not an error but the expected
//! trigger for the warm-boot recovery path.
//!
//! `ember-error` stays independent of `ember-types` so it can sit below every
//! other crate; variants carry raw integers and conversion happens at crate
//! boundaries.

use thiserror::Error;

/// Unified error type for all Ember operations.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Host I/O error while loading or saving an image file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation failed: the attempt's window `[begin, end]` is empty.
    ///
    /// Non-fatal. The caller must unregister, ask the scheduler to re-create
    /// the task from its entry point, and terminate the current attempt.
    /// No object state has changed.
    #[error("validation conflict: task {task} window [{begin}, {end}] is empty")]
    Conflict { task: u16, begin: u32, end: u32 },

    /// The object exists in the geometry but has never been committed.
    #[error("object {object} not found")]
    ObjectNotFound { object: u16 },

    /// The object id is outside the configured table.
    #[error("object {object} out of range (table holds {limit})")]
    ObjectOutOfRange { object: u16, limit: usize },

    /// The task id is outside the configured table.
    #[error("task {task} out of range (table holds {limit})")]
    TaskOutOfRange { task: u16, limit: usize },

    /// An operation requires a registered attempt but none is active.
    #[error("task {task} has no registered attempt")]
    NotRegistered { task: u16 },

    /// A creation commit found no free object slot.
    #[error("object table full ({limit} slots)")]
    ObjectTableFull { limit: usize },

    /// `register` found no free write-set-reader slot.
    #[error("concurrency controller slots exhausted ({tasks} slots)")]
    ControllerSlotsExhausted { tasks: usize },

    /// `begin_task` found no free recovery-registry slot.
    #[error("recovery registry slots exhausted ({tasks} slots)")]
    RegistrySlotsExhausted { tasks: usize },

    /// An allocation larger than the whole pool; wraparound cannot help.
    #[error("allocation of {requested} bytes exceeds pool capacity {capacity}")]
    AllocationTooLarge { requested: usize, capacity: usize },

    /// `read_into` destination smaller than the object's recorded size.
    #[error("read buffer too small: need {needed} bytes, got {actual}")]
    ReadBufferTooSmall { needed: usize, actual: usize },

    /// An access past the end of the non-volatile image.
    #[error("image truncated: need {needed} bytes at offset {offset}, image is {actual}")]
    ImageTruncated {
        needed: usize,
        offset: usize,
        actual: usize,
    },

    /// The image header or framing failed validation.
    #[error("image corrupt: {detail}")]
    ImageCorrupt { detail: String },

    /// Layout arithmetic overflowed while placing a region.
    #[error("image layout overflow placing {region}")]
    LayoutOverflow { region: &'static str },

    /// The store geometry failed validation.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

impl EmberError {
    /// Whether this is the expected, non-fatal validation abort.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result alias using `EmberError`.
pub type Result<T> = std::result::Result<T, EmberError>;
