use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use super::executor::TaskExecutor;
use super::registry::ScheduledJob;
use super::store::SqliteStore;
use super::types::{
    truncate_to_seconds, ExecutionStatus, SchedulerError, TaskExecutionRecord, TaskSchedule,
};

/// Seconds after an execution during which reconciliation must not
/// re-trigger the same task.
pub(crate) const COOLDOWN_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Executed,
    /// A concurrent trigger found the task already running and was
    /// dropped without touching the store.
    SkippedRunning,
}

/// Wraps task execution with single-flight, timing, history recording
/// and the post-run schedule update.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    running: HashSet<String>,
    recently_executed: HashMap<String, NaiveDateTime>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_task_running(&self, task_name: &str) -> bool {
        self.running.contains(task_name)
    }

    pub fn set_task_running(&mut self, task_name: &str, running: bool) {
        if running {
            self.running.insert(task_name.to_string());
        } else {
            self.running.remove(task_name);
        }
    }

    /// True while the task's last execution is inside the cooldown
    /// window. A stale entry is evicted on the way out.
    pub fn in_cooldown(&mut self, task_name: &str, now: NaiveDateTime) -> bool {
        if let Some(executed_at) = self.recently_executed.get(task_name) {
            let elapsed = (now - *executed_at).num_seconds();
            if elapsed < COOLDOWN_SECS {
                info!(
                    "skipping {} - executed {}s ago (cooldown)",
                    task_name, elapsed
                );
                return true;
            }
            info!(
                "cooldown expired for {} - last executed {}s ago",
                task_name, elapsed
            );
            self.recently_executed.remove(task_name);
        }
        false
    }

    /// Run one job with full tracking.
    ///
    /// A second trigger while the task is running is dropped, not
    /// queued, and performs zero store writes. In every other case
    /// exactly one execution row is written and the schedule row is
    /// upserted with the freshly advanced next run time; an execution
    /// error propagates only after that bookkeeping lands.
    pub fn run_job<E: TaskExecutor>(
        &mut self,
        store: &SqliteStore,
        executor: &E,
        job: &mut ScheduledJob,
        now: NaiveDateTime,
    ) -> Result<RunOutcome, SchedulerError> {
        let task_name = job.task.name.clone();
        if self.is_task_running(&task_name) {
            warn!("task {} is already running, skipping execution", task_name);
            return Ok(RunOutcome::SkippedRunning);
        }

        self.running.insert(task_name.clone());
        let execution_time = truncate_to_seconds(now);
        let started = Instant::now();

        info!("starting task: {}", task_name);
        let result = executor.execute(&job.task);

        // The running flag comes off before any store call can fail.
        self.running.remove(&task_name);
        let duration = started.elapsed().as_secs_f64();

        let (status, error_message) = match &result {
            Ok(()) => {
                info!("task {} completed successfully", task_name);
                (ExecutionStatus::Success, None)
            }
            Err(err) => {
                error!("task {} failed: {}", task_name, err);
                (ExecutionStatus::Failed, Some(err.to_string()))
            }
        };

        let next_run = match job.slot.advance(now) {
            Ok(next_run) => Some(next_run),
            Err(err) => {
                warn!("no next run time available for {}: {}", task_name, err);
                None
            }
        };

        store.record_execution(&TaskExecutionRecord {
            task_name: task_name.clone(),
            execution_time,
            next_run_time: next_run,
            status,
            duration,
            error_message,
            retry_count: job.task.retry_count,
        })?;
        self.recently_executed
            .insert(task_name.clone(), execution_time);

        if let Some(next_run) = next_run {
            store.upsert_schedule(&TaskSchedule {
                task_name,
                next_run_time: next_run,
                schedule_config: job.schedule_config.clone(),
                last_updated: execution_time,
                is_active: true,
            })?;
        }

        result.map(|()| RunOutcome::Executed)
    }
}
