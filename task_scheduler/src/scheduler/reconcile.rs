use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use super::executor::TaskExecutor;
use super::registry::JobRegistry;
use super::store::SqliteStore;
use super::tracker::ExecutionTracker;
use super::types::{truncate_to_seconds, SchedulerError, TaskSchedule};

/// Overdue work older than this is re-aligned forward without running,
/// so an outage never triggers a backfill storm.
pub(crate) const MAX_OVERDUE_MINUTES: f64 = 1440.0;

/// One reconciliation pass: compare persisted schedules to the clock
/// and decide, per overdue row, whether to execute now, re-align
/// silently, or deactivate.
///
/// Rows come back oldest first and are handled in that order. A task
/// inside the post-execution cooldown is skipped for this pass; its
/// own tracked write is still settling.
pub fn reconcile<E: TaskExecutor>(
    store: &SqliteStore,
    registry: &mut JobRegistry,
    tracker: &mut ExecutionTracker,
    executor: &E,
    now: NaiveDateTime,
) -> Result<(), SchedulerError> {
    let now = truncate_to_seconds(now);
    let overdue = store.overdue_schedules(now)?;
    if overdue.is_empty() {
        return Ok(());
    }

    info!("found {} overdue schedules to check", overdue.len());
    for schedule in overdue {
        if tracker.in_cooldown(&schedule.task_name, now) {
            continue;
        }

        let job = match registry.find_job_mut(&schedule.task_name) {
            Some(job) => job,
            None => {
                // Source file unloaded or renamed; terminal unless the
                // task registers again.
                debug!(
                    "no live job for overdue schedule {}, deactivating",
                    schedule.task_name
                );
                store.deactivate_task(&schedule.task_name, now)?;
                continue;
            }
        };

        let overdue_minutes = (now - schedule.next_run_time).num_seconds() as f64 / 60.0;
        if overdue_minutes > 0.0 && overdue_minutes <= MAX_OVERDUE_MINUTES {
            info!(
                "executing overdue task {} (overdue by {:.1} minutes)",
                schedule.task_name, overdue_minutes
            );
            match tracker.run_job(store, executor, job, now) {
                Ok(_) => {
                    store.upsert_schedule(&TaskSchedule {
                        task_name: schedule.task_name.clone(),
                        next_run_time: job.slot.next_run(),
                        schedule_config: schedule.schedule_config.clone(),
                        last_updated: now,
                        is_active: true,
                    })?;
                }
                Err(err) => {
                    error!("failed to run overdue task {}: {}", schedule.task_name, err);
                }
            }
        } else if overdue_minutes > MAX_OVERDUE_MINUTES {
            warn!(
                "task {} is too overdue ({:.1} minutes), updating next run time without execution",
                schedule.task_name, overdue_minutes
            );
            let next_run = job.slot.advance(now)?;
            store.upsert_schedule(&TaskSchedule {
                task_name: schedule.task_name.clone(),
                next_run_time: next_run,
                schedule_config: schedule.schedule_config.clone(),
                last_updated: now,
                is_active: true,
            })?;
        }
        // Exactly due (zero minutes overdue) is the due-job path's
        // business, not the reconciler's.
    }

    Ok(())
}
