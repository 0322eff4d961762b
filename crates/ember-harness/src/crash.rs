//! Scripted power-loss replay.
//!
//! Runs a deterministic commit workload in segments, "losing power" between
//! segments by snapshotting the image and warm-booting a fresh runtime from
//! it. After every boot, each object the script believes committed is
//! verified against the store bit-for-bit.

use crate::{lcg_next, CooperativeScheduler};
use ember::{
    volatile_task, AttemptOutcome, EntryPoint, ObjectId, Priority, Result, Runtime, StoreGeometry,
    TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Shape of one crash-replay run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CrashReplayConfig {
    /// Number of power cycles (segments of work separated by power loss).
    pub segments: u32,
    /// Commits attempted per segment.
    pub commits_per_segment: u32,
    /// LCG seed for workload shaping.
    pub seed: u64,
}

impl Default for CrashReplayConfig {
    fn default() -> Self {
        Self {
            segments: 6,
            commits_per_segment: 8,
            seed: 0x5EED,
        }
    }
}

/// What a crash-replay run observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashReplayReport {
    pub segments: u32,
    pub commits: u32,
    pub aborts: u32,
    pub recoveries: u32,
    pub tasks_recreated: u32,
    pub tasks_promoted: u32,
    pub tasks_resumed: u32,
    /// Objects whose committed bytes did not survive a power cycle.
    pub verification_failures: u32,
    pub fail_count: u32,
    pub objects_committed: u32,
}

const WRITER: TaskId = TaskId(0);

/// Bytes per committed version in the script.
const PAYLOAD_BYTES: usize = 8;

/// Run the scripted workload. Deterministic for a given config.
pub fn run_crash_replay(config: CrashReplayConfig) -> Result<CrashReplayReport> {
    // Size the writer's data pool for the whole script: bump pools have no
    // free, and wraparound over a still-live version would (correctly) fail
    // the durability verification below.
    let total_bytes = (config.segments as usize)
        .saturating_mul(config.commits_per_segment as usize)
        .saturating_mul(PAYLOAD_BYTES);
    let geometry = StoreGeometry {
        data_pool_bytes: total_bytes.max(512),
        ..StoreGeometry::default()
    };
    let mut report = CrashReplayReport {
        segments: config.segments,
        ..CrashReplayReport::default()
    };

    let mut rng = config.seed;
    let mut image: Option<Vec<u8>> = None;
    // The script's own model of what must be durable.
    let mut expected: BTreeMap<u16, Vec<u8>> = BTreeMap::new();

    for segment in 0..config.segments {
        let (mut runtime, recovery) =
            Runtime::boot(geometry, image.take(), CooperativeScheduler::new())?;
        match recovery {
            Some(recovery) => {
                report.recoveries += 1;
                report.tasks_recreated += u32::try_from(recovery.recreated_volatile.len())
                    .unwrap_or(u32::MAX);
                report.tasks_promoted +=
                    u32::try_from(recovery.promoted.len()).unwrap_or(u32::MAX);
                report.tasks_resumed +=
                    u32::try_from(recovery.resumed.len()).unwrap_or(u32::MAX);
                report.fail_count = recovery.fail_count;
            }
            None => {
                runtime.create_task(&volatile_task(
                    EntryPoint(1),
                    "crash writer",
                    Priority(1),
                    WRITER,
                ))?;
                runtime.start()?;
            }
        }

        // Everything committed before the power cycle must still be there.
        for (id, bytes) in &expected {
            match runtime.db().peek_object(ObjectId(*id)) {
                Ok(stored) if stored == *bytes => {}
                _ => report.verification_failures += 1,
            }
        }

        for _ in 0..config.commits_per_segment {
            runtime.tick()?;

            // Update an existing object most of the time, create otherwise.
            let update = !expected.is_empty() && lcg_next(&mut rng) % 4 != 0;
            let target = if update {
                let keys: Vec<u16> = expected.keys().copied().collect();
                let pick = usize::try_from(lcg_next(&mut rng)).unwrap_or(0) % keys.len();
                Some(ObjectId(keys[pick]))
            } else if expected.len() < geometry.objects {
                None
            } else {
                continue;
            };

            let mut payload = [0_u8; PAYLOAD_BYTES];
            payload.copy_from_slice(&lcg_next(&mut rng).to_le_bytes());
            match runtime.run_attempt(WRITER, |db, attempt| {
                let mut work = db.working_buffer(attempt, target)?;
                work.bytes_mut()[..PAYLOAD_BYTES].copy_from_slice(&payload);
                db.commit(attempt, &work, PAYLOAD_BYTES)
            })? {
                AttemptOutcome::Completed(id) => {
                    expected.insert(id.0, payload.to_vec());
                    report.commits += 1;
                }
                AttemptOutcome::Aborted => report.aborts += 1,
            }
        }

        info!(segment, commits = report.commits, "segment complete; power loss");
        image = Some(runtime.db().snapshot());
    }

    report.objects_committed = u32::try_from(expected.len()).unwrap_or(u32::MAX);
    Ok(report)
}
