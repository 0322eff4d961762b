#![forbid(unsafe_code)]
//! End-to-end harness for Ember.
//!
//! Provides the cooperative scheduler the demos and e2e suites drive tasks
//! with, an on-host image file format (so a simulated device can "power off"
//! to disk and come back), and the demo / crash-replay workloads the binary
//! exposes.

pub mod crash;
pub mod demo;

use ember::{Result, Scheduler, StackLocation, StoreGeometry, TaskId, TaskSpec, TcbNumber};
use ember::EmberError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ── Cooperative scheduler ───────────────────────────────────────────────────

/// Everything a scheduler was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Created { task: TaskId, location: StackLocation },
    Resumed { task: TaskId },
    Suspended { task: TaskId },
    DeletedCurrent,
    Started,
}

/// A recording, cooperative stand-in for the real-time scheduler.
///
/// Task bodies are driven by the harness itself (attempt by attempt), so
/// "creating" a task here just hands out a control-block number and records
/// the event; the interesting part is the order recovery asks things in.
#[derive(Debug, Default)]
pub struct CooperativeScheduler {
    next_tcb: u32,
    events: Vec<SchedulerEvent>,
}

impl CooperativeScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[SchedulerEvent] {
        &self.events
    }

    /// Tasks currently considered live: created or resumed, deduplicated.
    #[must_use]
    pub fn live_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self
            .events
            .iter()
            .filter_map(|event| match event {
                SchedulerEvent::Created { task, .. } | SchedulerEvent::Resumed { task } => {
                    Some(*task)
                }
                _ => None,
            })
            .collect();
        tasks.sort_unstable();
        tasks.dedup();
        tasks
    }
}

impl Scheduler for CooperativeScheduler {
    fn create_task(&mut self, spec: &TaskSpec) -> Result<TcbNumber> {
        self.next_tcb += 1;
        self.events.push(SchedulerEvent::Created {
            task: spec.task,
            location: spec.location,
        });
        Ok(TcbNumber(self.next_tcb))
    }

    fn resume_persisted(&mut self, task: TaskId, _tcb_addr: ember::NvAddr) -> Result<()> {
        self.events.push(SchedulerEvent::Resumed { task });
        Ok(())
    }

    fn suspend(&mut self, task: TaskId) -> Result<()> {
        self.events.push(SchedulerEvent::Suspended { task });
        Ok(())
    }

    fn delete_current(&mut self) -> Result<()> {
        self.events.push(SchedulerEvent::DeletedCurrent);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.events.push(SchedulerEvent::Started);
        Ok(())
    }
}

// ── Image files ─────────────────────────────────────────────────────────────
//
// On-host framing for a saved FRAM image:
//
// +-----------+--------+
// | magic     | 4 bytes| = "EMBI"
// | version   | 2 bytes| = 1
// | reserved  | 2 bytes|
// | geometry  | 32 bytes| 8 x u32 (objects, tasks, readers, heap, data,
// |           |        |          stack, tcb, scratch)
// | len       | 4 bytes| payload length
// | payload   | N bytes| the raw image
// | crc32c    | 4 bytes| over everything before this field
// +-----------+--------+

/// Image file magic ("EMBI", little-endian).
pub const IMAGE_FILE_MAGIC: u32 = 0x4942_4D45;

/// Current image file format version.
pub const IMAGE_FILE_VERSION: u16 = 1;

const IMAGE_HEADER_LEN: usize = 4 + 2 + 2 + 32 + 4;

#[allow(clippy::cast_possible_truncation)] // all fields validated well below u32::MAX
fn geometry_words(geometry: &StoreGeometry) -> [u32; 8] {
    [
        geometry.objects as u32,
        geometry.tasks as u32,
        geometry.max_readers as u32,
        geometry.heap_pool_bytes as u32,
        geometry.data_pool_bytes as u32,
        geometry.stack_bytes as u32,
        geometry.tcb_bytes as u32,
        geometry.scratch_bytes as u32,
    ]
}

/// Frame and write an image to disk.
pub fn save_image(path: impl AsRef<Path>, geometry: &StoreGeometry, image: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(IMAGE_HEADER_LEN + image.len() + 4);
    out.extend_from_slice(&IMAGE_FILE_MAGIC.to_le_bytes());
    out.extend_from_slice(&IMAGE_FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    for word in geometry_words(geometry) {
        out.extend_from_slice(&word.to_le_bytes());
    }
    let len = u32::try_from(image.len()).map_err(|_| EmberError::ImageCorrupt {
        detail: "image too large for file framing".to_owned(),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(image);
    let crc = crc32c::crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    fs::write(path, out)?;
    Ok(())
}

/// Read and validate an image file, returning its geometry and raw bytes.
pub fn load_image(path: impl AsRef<Path>) -> Result<(StoreGeometry, Vec<u8>)> {
    let data = fs::read(path)?;
    if data.len() < IMAGE_HEADER_LEN + 4 {
        return Err(EmberError::ImageCorrupt {
            detail: format!("image file too short: {} bytes", data.len()),
        });
    }

    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = crc32c::crc32c(body);
    if stored_crc != computed {
        return Err(EmberError::ImageCorrupt {
            detail: format!("image file crc mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"),
        });
    }

    let magic = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if magic != IMAGE_FILE_MAGIC {
        return Err(EmberError::ImageCorrupt {
            detail: format!("image file magic mismatch: {magic:#010x}"),
        });
    }
    let version = u16::from_le_bytes([body[4], body[5]]);
    if version != IMAGE_FILE_VERSION {
        return Err(EmberError::ImageCorrupt {
            detail: format!("unsupported image file version {version}"),
        });
    }

    let mut words = [0_u32; 8];
    for (index, word) in words.iter_mut().enumerate() {
        let offset = 8 + index * 4;
        *word = u32::from_le_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]);
    }
    let geometry = StoreGeometry {
        objects: words[0] as usize,
        tasks: words[1] as usize,
        max_readers: words[2] as usize,
        heap_pool_bytes: words[3] as usize,
        data_pool_bytes: words[4] as usize,
        stack_bytes: words[5] as usize,
        tcb_bytes: words[6] as usize,
        scratch_bytes: words[7] as usize,
    };

    let len = u32::from_le_bytes([body[40], body[41], body[42], body[43]]) as usize;
    let payload = &body[IMAGE_HEADER_LEN..];
    if payload.len() != len {
        return Err(EmberError::ImageCorrupt {
            detail: format!("image payload length mismatch: header {len}, actual {}", payload.len()),
        });
    }
    Ok((geometry, payload.to_vec()))
}

/// A deterministic linear congruential generator for workload shaping.
#[must_use]
pub fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}
