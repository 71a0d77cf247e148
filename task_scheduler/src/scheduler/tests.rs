use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use tempfile::TempDir;

use crate::task_parser::{RunSpec, ScheduleSpec, TaskDefinition};

use super::{
    reconcile, ExecutionStatus, ExecutionTracker, IntervalUnit, JobRegistry, RunOutcome,
    Scheduler, ScheduledJob, SchedulerError, SqliteStore, TaskExecutor, TaskSchedule,
};

#[derive(Default)]
struct NoopExecutor;

impl TaskExecutor for NoopExecutor {
    fn execute(&self, _task: &TaskDefinition) -> Result<(), SchedulerError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingExecutor {
    runs: RefCell<Vec<String>>,
}

impl RecordingExecutor {
    fn run_count(&self) -> usize {
        self.runs.borrow().len()
    }
}

impl TaskExecutor for RecordingExecutor {
    fn execute(&self, task: &TaskDefinition) -> Result<(), SchedulerError> {
        self.runs.borrow_mut().push(task.name.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FailingExecutor {
    runs: Cell<usize>,
}

impl TaskExecutor for FailingExecutor {
    fn execute(&self, task: &TaskDefinition) -> Result<(), SchedulerError> {
        self.runs.set(self.runs.get() + 1);
        Err(SchedulerError::TaskFailed(format!(
            "{} blew up",
            task.name
        )))
    }
}

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 2)
        .expect("date")
        .and_hms_opt(h, m, s)
        .expect("time")
}

fn definition_with(name: &str, schedule: ScheduleSpec) -> TaskDefinition {
    TaskDefinition {
        name: name.to_string(),
        title: name.to_string(),
        description: String::new(),
        enabled: true,
        dependencies: Vec::new(),
        timeout_secs: 300,
        retry_count: 0,
        retry_delay_secs: 60,
        schedule,
        run: RunSpec {
            command: "true".to_string(),
            args: Vec::new(),
            working_dir: None,
        },
    }
}

fn definition(name: &str, every_minutes: u32) -> TaskDefinition {
    definition_with(
        name,
        ScheduleSpec::Aligned {
            every: every_minutes,
            unit: IntervalUnit::Minutes,
        },
    )
}

fn open_store(temp: &TempDir) -> SqliteStore {
    SqliteStore::new(temp.path().join("scheduler.db")).expect("open store")
}

fn schedule_row(task_name: &str, next_run: NaiveDateTime) -> TaskSchedule {
    TaskSchedule {
        task_name: task_name.to_string(),
        next_run_time: next_run,
        schedule_config: "every 5 minutes".to_string(),
        last_updated: next_run,
        is_active: true,
    }
}

#[test]
fn store_round_trips_schedules() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);

    let row = schedule_row("alpha", at(10, 5, 0));
    store.upsert_schedule(&row).expect("upsert");
    let loaded = store
        .get_schedule("alpha")
        .expect("get")
        .expect("row present");
    assert_eq!(loaded, row);
    assert!(store.get_schedule("missing").expect("get").is_none());
}

#[test]
fn overdue_schedules_come_back_oldest_first() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let now = at(12, 0, 0);

    store
        .upsert_schedule(&schedule_row("ten", now - Duration::minutes(10)))
        .expect("upsert");
    store
        .upsert_schedule(&schedule_row("thirty", now - Duration::minutes(30)))
        .expect("upsert");
    store
        .upsert_schedule(&schedule_row("twenty", now - Duration::minutes(20)))
        .expect("upsert");
    store
        .upsert_schedule(&schedule_row("future", now + Duration::minutes(5)))
        .expect("upsert");

    let overdue = store.overdue_schedules(now).expect("overdue");
    let names: Vec<&str> = overdue.iter().map(|row| row.task_name.as_str()).collect();
    assert_eq!(names, vec!["thirty", "twenty", "ten"]);
}

#[test]
fn inactive_schedules_never_show_up_as_overdue() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let now = at(12, 0, 0);

    let mut row = schedule_row("beta", now - Duration::minutes(10));
    row.is_active = false;
    store.upsert_schedule(&row).expect("upsert");

    assert!(store.overdue_schedules(now).expect("overdue").is_empty());
}

#[test]
fn deactivate_keeps_the_row_but_hides_it() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let now = at(9, 0, 0);

    store
        .upsert_schedule(&schedule_row("gamma", now - Duration::minutes(1)))
        .expect("upsert");
    store.deactivate_task("gamma", now).expect("deactivate");

    let row = store.get_schedule("gamma").expect("get").expect("row");
    assert!(!row.is_active);
    assert!(store.overdue_schedules(now).expect("overdue").is_empty());
}

#[test]
fn execution_history_round_trips_and_expires() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let now = at(12, 0, 0);

    store
        .record_execution(&super::TaskExecutionRecord {
            task_name: "alpha".to_string(),
            execution_time: now - Duration::days(40),
            next_run_time: None,
            status: ExecutionStatus::Failed,
            duration: 0.5,
            error_message: Some("boom".to_string()),
            retry_count: 2,
        })
        .expect("record old");
    store
        .record_execution(&super::TaskExecutionRecord {
            task_name: "alpha".to_string(),
            execution_time: now - Duration::minutes(5),
            next_run_time: Some(now + Duration::minutes(5)),
            status: ExecutionStatus::Success,
            duration: 1.25,
            error_message: None,
            retry_count: 0,
        })
        .expect("record recent");

    let last = store
        .last_execution("alpha")
        .expect("get")
        .expect("row present");
    assert_eq!(last.status, ExecutionStatus::Success);
    assert_eq!(last.execution_time, now - Duration::minutes(5));
    assert_eq!(last.retry_count, 0);

    let removed = store.cleanup_old_executions(now, 30).expect("cleanup");
    assert_eq!(removed, 1);
    let last = store.last_execution("alpha").expect("get").expect("row");
    assert_eq!(last.status, ExecutionStatus::Success);
}

#[test]
fn scheduler_state_round_trips() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let now = at(8, 0, 0);

    assert!(store.get_state("running").expect("get").is_none());
    store.set_state("running", "true", now).expect("set");
    store.set_state("running", "false", now).expect("overwrite");
    assert_eq!(
        store.get_state("running").expect("get").as_deref(),
        Some("false")
    );
}

#[test]
fn registry_rejects_duplicate_live_registration() {
    let now = at(10, 2, 0);
    let mut registry = JobRegistry::new();
    registry
        .register(ScheduledJob::new(definition("alpha", 5), now).expect("job"))
        .expect("first registration");

    let err = registry
        .register(ScheduledJob::new(definition("alpha", 5), now).expect("job"))
        .expect_err("duplicate must be rejected");
    assert!(matches!(err, SchedulerError::DuplicateTask(_)));

    assert!(registry.unregister("alpha"));
    assert!(!registry.unregister("alpha"));
    registry
        .register(ScheduledJob::new(definition("alpha", 5), now).expect("job"))
        .expect("re-registration after unregister");
}

#[test]
fn due_jobs_sort_by_next_run() {
    let mut registry = JobRegistry::new();
    let mut early = ScheduledJob::new(definition("early", 5), at(10, 0, 0)).expect("job");
    let mut late = ScheduledJob::new(definition("late", 5), at(10, 0, 0)).expect("job");
    early.slot = super::JobSlot::Aligned(
        super::AlignedJob::new(5, IntervalUnit::Minutes, at(9, 0, 0)).expect("slot"),
    );
    late.slot = super::JobSlot::Aligned(
        super::AlignedJob::new(5, IntervalUnit::Minutes, at(9, 30, 0)).expect("slot"),
    );
    registry.register(late).expect("register");
    registry.register(early).expect("register");

    let due = registry.due_task_names(at(10, 0, 0));
    assert_eq!(due, vec!["early".to_string(), "late".to_string()]);
}

#[test]
fn tracker_records_execution_and_new_schedule() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut job = ScheduledJob::new(definition("alpha", 5), at(10, 2, 0)).expect("job");
    assert_eq!(job.slot.next_run(), at(10, 5, 0));

    let outcome = tracker
        .run_job(&store, &executor, &mut job, at(10, 5, 0))
        .expect("run");
    assert_eq!(outcome, RunOutcome::Executed);
    assert_eq!(executor.run_count(), 1);
    assert_eq!(job.slot.next_run(), at(10, 10, 0));

    let execution = store.last_execution("alpha").expect("get").expect("row");
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.execution_time, at(10, 5, 0));
    assert_eq!(execution.next_run_time, Some(at(10, 10, 0)));

    let schedule = store.get_schedule("alpha").expect("get").expect("row");
    assert_eq!(schedule.next_run_time, at(10, 10, 0));
    assert!(schedule.is_active);
}

#[test]
fn tracker_drops_concurrent_trigger_without_writes() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut job = ScheduledJob::new(definition("alpha", 5), at(10, 2, 0)).expect("job");

    tracker.set_task_running("alpha", true);
    let outcome = tracker
        .run_job(&store, &executor, &mut job, at(10, 5, 0))
        .expect("run");

    assert_eq!(outcome, RunOutcome::SkippedRunning);
    assert_eq!(executor.run_count(), 0);
    assert!(store.last_execution("alpha").expect("get").is_none());
    assert!(store.get_schedule("alpha").expect("get").is_none());
    // The schedule slot was not advanced either.
    assert_eq!(job.slot.next_run(), at(10, 5, 0));
}

#[test]
fn tracker_records_failure_then_propagates() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = FailingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut job = ScheduledJob::new(definition("alpha", 5), at(10, 2, 0)).expect("job");

    let err = tracker
        .run_job(&store, &executor, &mut job, at(10, 5, 0))
        .expect_err("failure must propagate");
    assert!(matches!(err, SchedulerError::TaskFailed(_)));
    assert!(!tracker.is_task_running("alpha"));

    // Tracking still landed: one failed row plus the advanced schedule.
    let execution = store.last_execution("alpha").expect("get").expect("row");
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution
        .error_message
        .as_deref()
        .expect("message")
        .contains("blew up"));
    let schedule = store.get_schedule("alpha").expect("get").expect("row");
    assert_eq!(schedule.next_run_time, at(10, 10, 0));
}

#[test]
fn free_interval_job_fires_and_advances() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut job = ScheduledJob::new(
        definition_with("fast", ScheduleSpec::EverySeconds { seconds: 30 }),
        at(10, 0, 0),
    )
    .expect("job");

    assert!(!job.slot.is_aligned());
    assert_eq!(job.slot.next_run(), at(10, 0, 30));
    assert!(!job.slot.should_run(at(10, 0, 29)));
    assert!(job.slot.should_run(at(10, 0, 30)));

    tracker
        .run_job(&store, &executor, &mut job, at(10, 0, 30))
        .expect("run");
    assert_eq!(executor.run_count(), 1);
    assert_eq!(job.slot.next_run(), at(10, 1, 0));

    let schedule = store.get_schedule("fast").expect("get").expect("row");
    assert_eq!(schedule.next_run_time, at(10, 1, 0));
    assert_eq!(schedule.schedule_config, "every 30 seconds");
}

#[test]
fn calendar_job_targets_weekday_time_and_advances_a_week() {
    // The fixture date 2025-06-02 is a Monday.
    let mut job = ScheduledJob::new(
        definition_with(
            "weekly",
            ScheduleSpec::Calendar {
                weekday: Some(Weekday::Mon),
                at: NaiveTime::from_hms_opt(10, 30, 0).expect("time"),
            },
        ),
        at(10, 2, 0),
    )
    .expect("job");

    assert!(!job.slot.is_aligned());
    assert_eq!(job.slot.next_run(), at(10, 30, 0));

    let next = job.slot.advance(at(10, 30, 0)).expect("advance");
    let following_monday = NaiveDate::from_ymd_opt(2025, 6, 9)
        .expect("date")
        .and_hms_opt(10, 30, 0)
        .expect("time");
    assert_eq!(next, following_monday);
}

#[test]
fn cooldown_skips_then_expires() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut job = ScheduledJob::new(definition("alpha", 5), at(10, 2, 0)).expect("job");

    tracker
        .run_job(&store, &executor, &mut job, at(10, 5, 0))
        .expect("run");

    assert!(tracker.in_cooldown("alpha", at(10, 5, 10)));
    assert!(tracker.in_cooldown("alpha", at(10, 5, 29)));
    // At thirty seconds the entry is evicted and the task is eligible.
    assert!(!tracker.in_cooldown("alpha", at(10, 5, 30)));
    assert!(!tracker.in_cooldown("alpha", at(10, 5, 31)));
}

#[test]
fn reconcile_executes_overdue_task_and_realigns() {
    // Task every 5 minutes, registered at 10:02 so the first slot is
    // 10:05. At 10:06 it is one minute overdue: run it and persist the
    // fresh 10:10 slot.
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut registry = JobRegistry::new();
    registry
        .register(ScheduledJob::new(definition("alpha", 5), at(10, 2, 0)).expect("job"))
        .expect("register");
    store
        .upsert_schedule(&schedule_row("alpha", at(10, 5, 0)))
        .expect("upsert");

    reconcile(&store, &mut registry, &mut tracker, &executor, at(10, 6, 0)).expect("reconcile");

    assert_eq!(executor.run_count(), 1);
    let schedule = store.get_schedule("alpha").expect("get").expect("row");
    assert_eq!(schedule.next_run_time, at(10, 10, 0));
    assert!(schedule.is_active);
    let execution = store.last_execution("alpha").expect("get").expect("row");
    assert_eq!(execution.execution_time, at(10, 6, 0));
    assert_eq!(execution.next_run_time, Some(at(10, 10, 0)));
}

#[test]
fn reconcile_respects_cooldown_until_it_expires() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut registry = JobRegistry::new();
    registry
        .register(ScheduledJob::new(definition("alpha", 5), at(10, 2, 0)).expect("job"))
        .expect("register");
    store
        .upsert_schedule(&schedule_row("alpha", at(10, 5, 0)))
        .expect("upsert");

    reconcile(&store, &mut registry, &mut tracker, &executor, at(10, 6, 0)).expect("reconcile");
    assert_eq!(executor.run_count(), 1);

    // A racing writer put the old slot back; within the cooldown the
    // reconciler must not fire the task again.
    store
        .upsert_schedule(&schedule_row("alpha", at(10, 5, 0)))
        .expect("upsert");
    reconcile(&store, &mut registry, &mut tracker, &executor, at(10, 6, 10)).expect("reconcile");
    assert_eq!(executor.run_count(), 1);

    // Past the window the task is eligible again.
    reconcile(&store, &mut registry, &mut tracker, &executor, at(10, 6, 31)).expect("reconcile");
    assert_eq!(executor.run_count(), 2);
}

#[test]
fn reconcile_realigns_without_executing_past_one_day() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut registry = JobRegistry::new();
    let now = at(10, 2, 0);
    registry
        .register(ScheduledJob::new(definition("stale", 5), now).expect("job"))
        .expect("register");
    store
        .upsert_schedule(&schedule_row("stale", now - Duration::days(2)))
        .expect("upsert");

    reconcile(&store, &mut registry, &mut tracker, &executor, now).expect("reconcile");

    assert_eq!(executor.run_count(), 0);
    assert!(store.last_execution("stale").expect("get").is_none());
    let schedule = store.get_schedule("stale").expect("get").expect("row");
    assert_eq!(schedule.next_run_time, at(10, 5, 0));
    assert!(schedule.is_active);
}

#[test]
fn reconcile_deactivates_schedules_without_a_live_job() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut registry = JobRegistry::new();
    let now = at(10, 0, 0);
    store
        .upsert_schedule(&schedule_row("ghost", now - Duration::minutes(10)))
        .expect("upsert");

    reconcile(&store, &mut registry, &mut tracker, &executor, now).expect("reconcile");

    assert_eq!(executor.run_count(), 0);
    let schedule = store.get_schedule("ghost").expect("get").expect("row");
    assert!(!schedule.is_active);
}

#[test]
fn reconcile_processes_most_overdue_first() {
    let temp = TempDir::new().expect("tempdir");
    let store = open_store(&temp);
    let executor = RecordingExecutor::default();
    let mut tracker = ExecutionTracker::new();
    let mut registry = JobRegistry::new();
    let now = at(12, 0, 0);
    for name in ["newer", "older"] {
        registry
            .register(ScheduledJob::new(definition(name, 5), now).expect("job"))
            .expect("register");
    }
    store
        .upsert_schedule(&schedule_row("newer", now - Duration::minutes(10)))
        .expect("upsert");
    store
        .upsert_schedule(&schedule_row("older", now - Duration::minutes(30)))
        .expect("upsert");

    reconcile(&store, &mut registry, &mut tracker, &executor, now).expect("reconcile");

    assert_eq!(
        *executor.runs.borrow(),
        vec!["older".to_string(), "newer".to_string()]
    );
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let config_path = dir.join("config.toml");
    let body = format!(
        "[scheduler]\nloop_interval = 1\ntask_check_interval = 1\n\n[database]\npath = \"{}\"\n\n[tasks]\ndirectory = \"{}\"\n",
        dir.join("data/scheduler.db").display(),
        dir.join("tasks").display(),
    );
    fs::write(&config_path, body).expect("write config");
    config_path
}

const HEARTBEAT_TASK: &str = r#"
title = "Heartbeat"

[schedule]
every = 5
unit = "minutes"

[run]
command = "true"
"#;

#[test]
fn scheduler_loads_tasks_and_records_initial_schedules() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());
    let tasks_dir = temp.path().join("tasks");
    fs::create_dir_all(&tasks_dir).expect("tasks dir");
    fs::write(tasks_dir.join("heartbeat.toml"), HEARTBEAT_TASK).expect("write task");

    let mut scheduler = Scheduler::new(&config_path, NoopExecutor).expect("scheduler");
    scheduler.scan_and_load_tasks(at(10, 2, 0));

    assert_eq!(scheduler.registry.len(), 1);
    let schedule = scheduler
        .store
        .get_schedule("heartbeat")
        .expect("get")
        .expect("row");
    assert_eq!(schedule.next_run_time, at(10, 5, 0));
    assert!(schedule.is_active);

    let status = scheduler.status();
    assert_eq!(status.loaded_tasks, 1);
    assert_eq!(status.scheduled_jobs, 1);
    assert!(!status.running);
}

#[test]
fn scheduler_unloads_tasks_whose_files_disappear() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());
    let tasks_dir = temp.path().join("tasks");
    fs::create_dir_all(&tasks_dir).expect("tasks dir");
    let task_path = tasks_dir.join("heartbeat.toml");
    fs::write(&task_path, HEARTBEAT_TASK).expect("write task");

    let mut scheduler = Scheduler::new(&config_path, NoopExecutor).expect("scheduler");
    scheduler.scan_and_load_tasks(at(10, 2, 0));
    assert_eq!(scheduler.registry.len(), 1);

    fs::remove_file(&task_path).expect("remove task");
    scheduler.scan_and_load_tasks(at(10, 3, 0));

    assert_eq!(scheduler.registry.len(), 0);
    let schedule = scheduler
        .store
        .get_schedule("heartbeat")
        .expect("get")
        .expect("row survives deactivated");
    assert!(!schedule.is_active);
}

#[derive(Clone, Default)]
struct SharedRecordingExecutor {
    runs: Rc<RefCell<Vec<String>>>,
}

impl TaskExecutor for SharedRecordingExecutor {
    fn execute(&self, task: &TaskDefinition) -> Result<(), SchedulerError> {
        self.runs.borrow_mut().push(task.name.clone());
        Ok(())
    }
}

const FAST_TASK: &str = r#"
title = "Fast"

[schedule]
every_seconds = 30

[run]
command = "true"
"#;

#[test]
fn scheduler_runs_aligned_jobs_before_delegated_ones() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());
    let tasks_dir = temp.path().join("tasks");
    fs::create_dir_all(&tasks_dir).expect("tasks dir");
    fs::write(tasks_dir.join("heartbeat.toml"), HEARTBEAT_TASK).expect("write task");
    fs::write(tasks_dir.join("fast.toml"), FAST_TASK).expect("write task");

    let runs = Rc::new(RefCell::new(Vec::new()));
    let executor = SharedRecordingExecutor {
        runs: Rc::clone(&runs),
    };
    let mut scheduler = Scheduler::new(&config_path, executor).expect("scheduler");
    scheduler.scan_and_load_tasks(at(10, 2, 0));
    assert_eq!(scheduler.registry.len(), 2);

    // At 10:05 both are due (fast since 10:02:30); the aligned job
    // still goes first even though the delegated one is more overdue.
    scheduler.run_due_jobs(at(10, 5, 0));
    assert_eq!(
        *runs.borrow(),
        vec!["heartbeat".to_string(), "fast".to_string()]
    );

    let schedule = scheduler
        .store
        .get_schedule("fast")
        .expect("get")
        .expect("row");
    assert_eq!(schedule.next_run_time, at(10, 5, 30));
}

#[test]
fn scheduler_runs_due_jobs_through_the_tracker() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());
    let tasks_dir = temp.path().join("tasks");
    fs::create_dir_all(&tasks_dir).expect("tasks dir");
    fs::write(tasks_dir.join("heartbeat.toml"), HEARTBEAT_TASK).expect("write task");

    let mut scheduler = Scheduler::new(&config_path, RecordingExecutor::default()).expect("scheduler");
    scheduler.scan_and_load_tasks(at(10, 2, 0));

    // Not due yet at 10:04.
    scheduler.run_due_jobs(at(10, 4, 0));
    assert!(scheduler
        .store
        .last_execution("heartbeat")
        .expect("get")
        .is_none());

    scheduler.run_due_jobs(at(10, 5, 0));
    let execution = scheduler
        .store
        .last_execution("heartbeat")
        .expect("get")
        .expect("row");
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.next_run_time, Some(at(10, 10, 0)));
}
