//! Full power-loss lifecycle through the public runtime API.

use ember::{
    volatile_task, AttemptOutcome, EntryPoint, ObjectId, Priority, Runtime, StackLocation,
    StoreGeometry, TaskId,
};
use ember_harness::{CooperativeScheduler, SchedulerEvent};

fn geometry() -> StoreGeometry {
    StoreGeometry::default()
}

fn booted_with_worker() -> Runtime<CooperativeScheduler> {
    let mut runtime =
        Runtime::cold_boot(geometry(), CooperativeScheduler::new()).expect("cold boot");
    runtime
        .create_task(&volatile_task(EntryPoint(10), "worker", Priority(1), TaskId(0)))
        .expect("create");
    runtime.start().expect("start");
    runtime
}

#[test]
fn interrupted_task_is_recreated_and_then_promoted() {
    // Cold boot; the worker never commits before power loss.
    let runtime = booted_with_worker();
    let image = runtime.db().snapshot();

    // First power cycle: re-created from scratch in volatile storage.
    let (runtime, report) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");
    assert_eq!(report.recreated_volatile, vec![0]);
    assert!(report.promoted.is_empty());

    // Second power cycle, still no commit: promoted to durable handling.
    let image = runtime.db().snapshot();
    let (runtime, report) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");
    assert_eq!(report.promoted, vec![0]);
    assert_eq!(
        runtime.db().task_location(TaskId(0)).expect("location"),
        StackLocation::Durable
    );
    assert_eq!(report.fail_count, 2);
}

#[test]
fn committed_work_is_not_replayed() {
    let mut runtime = booted_with_worker();
    runtime.tick().expect("tick");

    // The worker commits: its work is durable, the registry entry resolves.
    let outcome = runtime
        .run_attempt(TaskId(0), |db, attempt| {
            let mut work = db.working_buffer(attempt, None)?;
            work.bytes_mut()[..2].copy_from_slice(&[7, 8]);
            db.commit(attempt, &work, 2)
        })
        .expect("attempt");
    assert!(matches!(outcome, AttemptOutcome::Completed(_)));

    let image = runtime.db().snapshot();
    let (runtime, report) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");

    // Nothing to re-create: the commit cleared the in-flight entry. The
    // committed bytes are still there.
    assert!(report.active_tasks().is_empty());
    assert_eq!(
        runtime.db().peek_object(ObjectId(0)).expect("peek"),
        vec![7, 8]
    );
}

#[test]
fn suspended_durable_task_resumes_across_power_loss() {
    let mut runtime =
        Runtime::cold_boot(geometry(), CooperativeScheduler::new()).expect("cold boot");
    runtime
        .create_task(&ember::TaskSpec {
            entry: EntryPoint(20),
            name: "lengthy",
            stack_bytes: 0,
            priority: Priority(2),
            task: TaskId(4),
            location: StackLocation::Durable,
            scheduler_owned: false,
        })
        .expect("create");

    // Low voltage: the runtime parks every durable task.
    runtime.on_low_voltage(TaskId(0)).expect("low voltage");
    runtime.start().expect("start");

    let image = runtime.db().snapshot();
    let (runtime, report) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");

    assert_eq!(report.resumed, vec![4]);
    assert_eq!(report.lengthy_failures, 0);
    assert!(runtime
        .scheduler()
        .events()
        .contains(&SchedulerEvent::Resumed { task: TaskId(4) }));
}

#[test]
fn durable_task_interrupted_mid_run_is_recreated_durable() {
    let mut runtime =
        Runtime::cold_boot(geometry(), CooperativeScheduler::new()).expect("cold boot");
    runtime
        .create_task(&ember::TaskSpec {
            entry: EntryPoint(21),
            name: "lengthy",
            stack_bytes: 0,
            priority: Priority(2),
            task: TaskId(5),
            location: StackLocation::Durable,
            scheduler_owned: false,
        })
        .expect("create");
    runtime.start().expect("start");

    // Power dies while the task is running: its context was never saved.
    let image = runtime.db().snapshot();
    let (_, report) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");
    assert_eq!(report.recreated_durable, vec![5]);
    assert_eq!(report.lengthy_failures, 1);
    assert!(report.resumed.is_empty());
}

/// Recovery interrupted by another power loss reconstructs the same task
/// set: no duplicates, nothing missing.
#[test]
fn double_recovery_yields_same_task_set() {
    let runtime = booted_with_worker();
    let image = runtime.db().snapshot();

    let (first_runtime, first) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");

    // Power loss during/right after recovery: boot again from the state
    // recovery left behind.
    let image = first_runtime.db().snapshot();
    let (second_runtime, second) =
        Runtime::warm_boot(geometry(), image, CooperativeScheduler::new()).expect("warm boot");

    assert_eq!(first.active_tasks(), vec![0]);
    assert_eq!(second.active_tasks(), vec![0]);
    assert_eq!(second_runtime.scheduler().live_tasks(), vec![TaskId(0)]);
}
