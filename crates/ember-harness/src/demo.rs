//! Demo workload: a producer/consumer pair over the versioned store.
//!
//! The producer commits a fresh value each round; the consumer reads it and
//! commits a derived object. A final contention round interleaves a writer
//! under an open reader attempt to demonstrate the abort-and-restart path.

use crate::CooperativeScheduler;
use ember::{
    volatile_task, AttemptOutcome, EntryPoint, ObjectId, Priority, Result, Runtime, StoreGeometry,
    TaskId,
};
use serde::{Deserialize, Serialize};
use tracing::info;

const PRODUCER: TaskId = TaskId(0);
const CONSUMER: TaskId = TaskId(1);

/// Outcome of one demo run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemoReport {
    pub iterations: u32,
    pub commits: u32,
    pub aborts: u32,
    pub produced_object: Option<u16>,
    pub derived_object: Option<u16>,
    pub final_produced: Option<u32>,
    pub final_derived: Option<u32>,
}

fn decode_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Run the demo for `iterations` rounds and return the runtime with its
/// final state (so the caller can save the image) plus the report.
pub fn run_demo(
    iterations: u32,
) -> Result<(Runtime<CooperativeScheduler>, DemoReport)> {
    let mut runtime =
        Runtime::cold_boot(StoreGeometry::default(), CooperativeScheduler::new())?;
    runtime.create_task(&volatile_task(EntryPoint(1), "producer", Priority(1), PRODUCER))?;
    runtime.create_task(&volatile_task(EntryPoint(2), "consumer", Priority(1), CONSUMER))?;
    runtime.start()?;

    let mut report = DemoReport {
        iterations,
        ..DemoReport::default()
    };
    let mut produced: Option<ObjectId> = None;
    let mut derived: Option<ObjectId> = None;

    for round in 0..iterations {
        runtime.tick()?;

        let target = produced;
        let value = round.wrapping_mul(2_654_435_761);
        match runtime.run_attempt(PRODUCER, |db, attempt| {
            let mut work = db.working_buffer(attempt, target)?;
            work.bytes_mut()[..4].copy_from_slice(&value.to_le_bytes());
            db.commit(attempt, &work, 4)
        })? {
            AttemptOutcome::Completed(id) => {
                produced = Some(id);
                report.commits += 1;
            }
            AttemptOutcome::Aborted => report.aborts += 1,
        }

        runtime.tick()?;
        if let Some(source) = produced {
            let target = derived;
            match runtime.run_attempt(CONSUMER, |db, attempt| {
                let bytes = db.read(attempt, source)?;
                let next = decode_u32(&bytes).wrapping_add(1);
                let mut work = db.working_buffer(attempt, target)?;
                work.bytes_mut()[..4].copy_from_slice(&next.to_le_bytes());
                db.commit(attempt, &work, 4)
            })? {
                AttemptOutcome::Completed(id) => {
                    derived = Some(id);
                    report.commits += 1;
                }
                AttemptOutcome::Aborted => report.aborts += 1,
            }
        }
    }

    // Contention round: the consumer's read is invalidated mid-attempt.
    if let Some(source) = produced {
        runtime.tick()?;
        let outcome = runtime.run_attempt(CONSUMER, |db, attempt| {
            let bytes = db.read(attempt, source)?;
            let observed = decode_u32(&bytes);

            let writer = db.register(PRODUCER)?;
            let mut work = db.working_buffer(writer, Some(source))?;
            work.bytes_mut()[..4].copy_from_slice(&observed.wrapping_add(100).to_le_bytes());
            db.commit(writer, &work, 4)?;
            db.unregister(writer)?;

            let mut work = db.working_buffer(attempt, derived)?;
            work.bytes_mut()[..4].copy_from_slice(&observed.to_le_bytes());
            db.commit(attempt, &work, 4)
        })?;
        if outcome.is_aborted() {
            report.aborts += 1;
            report.commits += 1; // the interleaved writer's commit landed
        }
    }

    report.produced_object = produced.map(|id| id.0);
    report.derived_object = derived.map(|id| id.0);
    if let Some(id) = produced {
        report.final_produced = Some(decode_u32(&runtime.db().peek_object(id)?));
    }
    if let Some(id) = derived {
        report.final_derived = Some(decode_u32(&runtime.db().peek_object(id)?));
    }

    info!(
        commits = report.commits,
        aborts = report.aborts,
        "demo complete"
    );
    Ok((runtime, report))
}
