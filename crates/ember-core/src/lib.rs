#![forbid(unsafe_code)]
//! Boot orchestration and scheduler glue.
//!
//! A device boots in one of two ways:
//!
//! - **Cold boot** — the image has never completed provisioning. Every
//!   persisted table is formatted, the application creates its tasks, and
//!   [`Runtime::start`] marks the image provisioned before entering the
//!   scheduler. From that point on the image is authoritative.
//! - **Warm boot** — power came back on a provisioned image. The failure
//!   counter is bumped, the recovery pass rebuilds the in-flight task set
//!   from the registry and the task flags, and the scheduler starts.
//!
//! Power loss is not an error: the boot path simply branches on the
//! persisted provisioned flag.

use ember_error::{EmberError, Result};
use ember_nvm::{Fram, Header};
use ember_store::{Attempt, Database};
use ember_tasks::{RecoveryReport, Scheduler, StackLocation, TaskSpec};
use ember_types::{LogicalTime, StoreGeometry, TaskId, TcbNumber};
use tracing::{debug, info};

/// How one attempt of a task body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome<T> {
    /// The body ran to completion (committing or not).
    Completed(T),
    /// Validation aborted the attempt; the task has been re-created from its
    /// entry point and the current instance deleted.
    Aborted,
}

impl<T> AttemptOutcome<T> {
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// The assembled runtime: the store plus the (out-of-scope) scheduler.
pub struct Runtime<S: Scheduler> {
    db: Database,
    scheduler: S,
}

impl<S: Scheduler> Runtime<S> {
    /// Cold boot: format a fresh image. The caller creates its tasks and
    /// then calls [`Runtime::start`].
    pub fn cold_boot(geometry: StoreGeometry, scheduler: S) -> Result<Self> {
        let db = Database::format(geometry)?;
        info!("cold boot: image formatted");
        Ok(Self { db, scheduler })
    }

    /// Warm boot: adopt a provisioned image, recover the in-flight task set,
    /// and start the scheduler.
    pub fn warm_boot(
        geometry: StoreGeometry,
        image: Vec<u8>,
        scheduler: S,
    ) -> Result<(Self, RecoveryReport)> {
        let db = Database::open(geometry, Fram::from_bytes(image))?;
        if !db.header()?.provisioned {
            return Err(EmberError::ImageCorrupt {
                detail: "warm boot on an unprovisioned image".to_owned(),
            });
        }
        let failures = db.bump_fail_count()?;
        info!(failures, "warm boot: recovering task set");

        let mut runtime = Self { db, scheduler };
        let report = runtime.db.recover(&mut runtime.scheduler)?;
        Ok((runtime, report))
    }

    /// Boot from an optional saved image: warm if it is a provisioned Ember
    /// image of the right shape, cold otherwise.
    pub fn boot(
        geometry: StoreGeometry,
        image: Option<Vec<u8>>,
        scheduler: S,
    ) -> Result<(Self, Option<RecoveryReport>)> {
        if let Some(bytes) = image {
            let fram = Fram::from_bytes(bytes);
            let provisioned = Header::load(&fram).map(|h| h.provisioned).unwrap_or(false);
            if provisioned {
                let (runtime, report) = Self::warm_boot(geometry, fram.snapshot(), scheduler)?;
                return Ok((runtime, Some(report)));
            }
        }
        Ok((Self::cold_boot(geometry, scheduler)?, None))
    }

    /// Finish a cold boot: mark the image provisioned and enter the
    /// scheduler's run loop. Subsequent boots of this image are warm.
    pub fn start(&mut self) -> Result<()> {
        self.db.set_provisioned()?;
        self.scheduler.start()
    }

    /// Create an application task, recording everything recovery needs.
    pub fn create_task(&mut self, spec: &TaskSpec) -> Result<TcbNumber> {
        self.db.create_task(&mut self.scheduler, spec)
    }

    /// Deliver one scheduler tick into the store's critical section.
    pub fn tick(&self) -> Result<LogicalTime> {
        self.db.tick()
    }

    /// Low-voltage event: suspend every durable task so its context is
    /// saved before the capacitor drains.
    pub fn on_low_voltage(&mut self, current: TaskId) -> Result<()> {
        self.db.suspend_lengthy(&mut self.scheduler, current)
    }

    /// Re-create `task` fresh from its recorded entry point and delete the
    /// current instance — the abort-and-restart path. There is no waiting
    /// primitive; a conflicting attempt is always resolved this way.
    pub fn rerun(&mut self, task: TaskId) -> Result<TcbNumber> {
        let (entry, priority) = self.db.task_entry_point(task)?;
        let location = self.db.task_location(task)?;
        self.db.clear_task_entries(task)?;
        let tcb = self.db.create_task(
            &mut self.scheduler,
            &TaskSpec {
                entry,
                name: "re-run task",
                stack_bytes: 0,
                priority,
                task,
                location,
                scheduler_owned: false,
            },
        )?;
        self.scheduler.delete_current()?;
        debug!(task = task.0, "task re-created after abort");
        Ok(tcb)
    }

    /// Drive one attempt of a task body: register, run, unregister; on a
    /// validation conflict, re-run the task and report
    /// [`AttemptOutcome::Aborted`].
    ///
    /// Cancellation is implicit: nothing beyond the attempt's working
    /// buffers is cleaned up, so resources held outside the store are the
    /// task author's responsibility.
    pub fn run_attempt<T>(
        &mut self,
        task: TaskId,
        body: impl FnOnce(&Database, Attempt) -> Result<T>,
    ) -> Result<AttemptOutcome<T>> {
        let attempt = self.db.register(task)?;
        match body(&self.db, attempt) {
            Ok(value) => {
                self.db.unregister(attempt)?;
                Ok(AttemptOutcome::Completed(value))
            }
            Err(error) if error.is_conflict() => {
                self.db.unregister(attempt)?;
                self.rerun(task)?;
                Ok(AttemptOutcome::Aborted)
            }
            Err(error) => {
                self.db.unregister(attempt)?;
                Err(error)
            }
        }
    }

    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    #[must_use]
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }
}

/// Convenience: the default application task spec, volatile stack.
#[must_use]
pub fn volatile_task(
    entry: ember_types::EntryPoint,
    name: &'static str,
    priority: ember_types::Priority,
    task: TaskId,
) -> TaskSpec {
    TaskSpec {
        entry,
        name,
        stack_bytes: 0,
        priority,
        task,
        location: StackLocation::Volatile,
        scheduler_owned: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::{EntryPoint, NvAddr, ObjectId, Priority};

    #[derive(Default)]
    struct MockScheduler {
        next_tcb: u32,
        created: Vec<(TaskId, StackLocation)>,
        resumed: Vec<TaskId>,
        suspended: Vec<TaskId>,
        deleted: u32,
        started: u32,
    }

    impl Scheduler for MockScheduler {
        fn create_task(&mut self, spec: &TaskSpec) -> Result<TcbNumber> {
            self.created.push((spec.task, spec.location));
            self.next_tcb += 1;
            Ok(TcbNumber(self.next_tcb))
        }
        fn resume_persisted(&mut self, task: TaskId, _tcb_addr: NvAddr) -> Result<()> {
            self.resumed.push(task);
            Ok(())
        }
        fn suspend(&mut self, task: TaskId) -> Result<()> {
            self.suspended.push(task);
            Ok(())
        }
        fn delete_current(&mut self) -> Result<()> {
            self.deleted += 1;
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            self.started += 1;
            Ok(())
        }
    }

    fn cold() -> Runtime<MockScheduler> {
        Runtime::cold_boot(StoreGeometry::default(), MockScheduler::default()).expect("cold boot")
    }

    #[test]
    fn cold_boot_provisions_on_start() {
        let mut runtime = cold();
        assert!(!runtime.db().header().expect("header").provisioned);
        runtime.start().expect("start");
        assert!(runtime.db().header().expect("header").provisioned);
        assert_eq!(runtime.scheduler().started, 1);
    }

    #[test]
    fn boot_branches_on_provisioned_flag() {
        // No image at all: cold.
        let (runtime, report) =
            Runtime::boot(StoreGeometry::default(), None, MockScheduler::default())
                .expect("boot");
        assert!(report.is_none());

        // Unprovisioned image: cold again.
        let image = runtime.db().snapshot();
        let (runtime, report) =
            Runtime::boot(StoreGeometry::default(), Some(image), MockScheduler::default())
                .expect("boot");
        assert!(report.is_none());

        // Provisioned image: warm, failure counted.
        let mut runtime = runtime;
        runtime.start().expect("start");
        let image = runtime.db().snapshot();
        let (warm, report) =
            Runtime::boot(StoreGeometry::default(), Some(image), MockScheduler::default())
                .expect("boot");
        let report = report.expect("warm boot report");
        assert_eq!(report.fail_count, 1);
        assert_eq!(warm.scheduler().started, 1);
    }

    #[test]
    fn warm_boot_rejects_unprovisioned_image() {
        let runtime = cold();
        let image = runtime.db().snapshot();
        assert!(matches!(
            Runtime::warm_boot(StoreGeometry::default(), image, MockScheduler::default()),
            Err(EmberError::ImageCorrupt { .. })
        ));
    }

    #[test]
    fn crash_recreates_task_created_before_start() {
        let mut runtime = cold();
        runtime
            .create_task(&volatile_task(
                EntryPoint(7),
                "worker",
                Priority(1),
                TaskId(2),
            ))
            .expect("create");
        runtime.start().expect("start");

        // Power loss mid-run.
        let image = runtime.db().snapshot();
        let (warm, report) =
            Runtime::warm_boot(StoreGeometry::default(), image, MockScheduler::default())
                .expect("warm boot");
        assert_eq!(report.recreated_volatile, vec![2]);
        assert_eq!(warm.scheduler().created, vec![(TaskId(2), StackLocation::Volatile)]);
    }

    #[test]
    fn run_attempt_commits_and_completes() {
        let mut runtime = cold();
        runtime
            .create_task(&volatile_task(EntryPoint(1), "writer", Priority(0), TaskId(0)))
            .expect("create");

        let outcome = runtime
            .run_attempt(TaskId(0), |db, attempt| {
                let mut work = db.working_buffer(attempt, None)?;
                work.bytes_mut()[..2].copy_from_slice(&[3, 4]);
                db.commit(attempt, &work, 2)
            })
            .expect("attempt");
        assert_eq!(outcome, AttemptOutcome::Completed(ObjectId(0)));
        assert_eq!(
            runtime.db().peek_object(ObjectId(0)).expect("peek"),
            vec![3, 4]
        );
    }

    #[test]
    fn run_attempt_reruns_on_conflict() {
        let mut runtime = cold();
        runtime
            .create_task(&volatile_task(EntryPoint(1), "writer", Priority(0), TaskId(0)))
            .expect("create");
        runtime
            .create_task(&volatile_task(EntryPoint(2), "reader", Priority(0), TaskId(1)))
            .expect("create");

        // Seed an object and advance time.
        runtime
            .run_attempt(TaskId(0), |db, attempt| {
                let mut work = db.working_buffer(attempt, None)?;
                work.bytes_mut()[0] = 1;
                db.commit(attempt, &work, 1)
            })
            .expect("seed");
        runtime.tick().expect("tick");

        // The reader observes the object, a writer updates it underneath,
        // and the reader's own commit is forced to abort.
        let created_before = runtime.scheduler().created.len();
        let outcome = runtime
            .run_attempt(TaskId(1), |db, attempt| {
                db.read(attempt, ObjectId(0))?;

                // Interleaved writer commit invalidating the read.
                let writer = db.register(TaskId(0))?;
                let mut work = db.working_buffer(writer, Some(ObjectId(0)))?;
                work.bytes_mut()[0] = 2;
                db.commit(writer, &work, 1)?;
                db.unregister(writer)?;

                let mut work = db.working_buffer(attempt, None)?;
                work.bytes_mut()[0] = 9;
                db.commit(attempt, &work, 1)
            })
            .expect("attempt");
        assert!(outcome.is_aborted());
        // run_attempt re-created the task and deleted the aborted instance.
        assert_eq!(runtime.scheduler().created.len(), created_before + 1);
        assert_eq!(runtime.scheduler().deleted, 1);
    }

    #[test]
    fn low_voltage_suspends_durable_tasks() {
        let mut runtime = cold();
        runtime
            .create_task(&TaskSpec {
                entry: EntryPoint(5),
                name: "lengthy",
                stack_bytes: 0,
                priority: Priority(1),
                task: TaskId(3),
                location: StackLocation::Durable,
                scheduler_owned: false,
            })
            .expect("create");

        runtime.on_low_voltage(TaskId(0)).expect("low voltage");
        assert_eq!(runtime.scheduler().suspended, vec![TaskId(3)]);

        // After the suspension its context counts as saved: a warm boot
        // resumes instead of re-creating.
        runtime.start().expect("start");
        let image = runtime.db().snapshot();
        let (_, report) =
            Runtime::warm_boot(StoreGeometry::default(), image, MockScheduler::default())
                .expect("warm boot");
        assert_eq!(report.resumed, vec![3]);
        assert_eq!(report.lengthy_failures, 0);
    }
}
