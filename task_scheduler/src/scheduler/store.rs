use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};

use super::types::{
    format_timestamp, parse_timestamp, truncate_to_seconds, ExecutionStatus, SchedulerError,
    TaskExecutionRecord, TaskSchedule,
};

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_schedules (
    task_name TEXT PRIMARY KEY,
    next_run_time TEXT NOT NULL,
    schedule_config TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS task_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name TEXT NOT NULL,
    execution_time TEXT NOT NULL,
    next_run_time TEXT,
    status TEXT NOT NULL,
    duration REAL NOT NULL,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS scheduler_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_task_executions_name
    ON task_executions(task_name);
CREATE INDEX IF NOT EXISTS idx_task_executions_time
    ON task_executions(execution_time);
CREATE INDEX IF NOT EXISTS idx_task_schedules_next_run
    ON task_schedules(next_run_time);
"#;

type ScheduleRow = (String, String, String, String, bool);
type ExecutionRow = (
    String,
    String,
    Option<String>,
    String,
    f64,
    Option<String>,
    u32,
);

/// SQLite-backed schedule and execution history store.
///
/// A single connection behind a mutex serializes access from the loop
/// thread and the memory monitor thread.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A panic elsewhere while holding the lock poisons it; the
    /// connection itself is still usable, so recover instead of
    /// propagating the poison to every later store call.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn upsert_schedule(&self, schedule: &TaskSchedule) -> Result<(), SchedulerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO task_schedules
             (task_name, next_run_time, schedule_config, last_updated, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                schedule.task_name,
                format_timestamp(schedule.next_run_time),
                schedule.schedule_config,
                format_timestamp(schedule.last_updated),
                schedule.is_active,
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, task_name: &str) -> Result<Option<TaskSchedule>, SchedulerError> {
        let conn = self.conn();
        let row: Option<ScheduleRow> = conn
            .query_row(
                "SELECT task_name, next_run_time, schedule_config, last_updated, is_active
                 FROM task_schedules WHERE task_name = ?1",
                params![task_name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(schedule_from_row).transpose()
    }

    /// Active schedules whose next run time is at or before `now`,
    /// oldest first. `now` is truncated to whole seconds so the
    /// comparison matches the stored precision.
    pub fn overdue_schedules(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<TaskSchedule>, SchedulerError> {
        let cutoff = format_timestamp(truncate_to_seconds(now));
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_name, next_run_time, schedule_config, last_updated, is_active
             FROM task_schedules
             WHERE next_run_time <= ?1 AND is_active = 1
             ORDER BY next_run_time",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?;
        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(schedule_from_row(row?)?);
        }
        Ok(schedules)
    }

    pub fn record_execution(&self, execution: &TaskExecutionRecord) -> Result<(), SchedulerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_executions
             (task_name, execution_time, next_run_time, status, duration,
              error_message, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?2)",
            params![
                execution.task_name,
                format_timestamp(execution.execution_time),
                execution.next_run_time.map(format_timestamp),
                execution.status.to_string(),
                execution.duration,
                execution.error_message,
                execution.retry_count,
            ],
        )?;
        Ok(())
    }

    pub fn last_execution(
        &self,
        task_name: &str,
    ) -> Result<Option<TaskExecutionRecord>, SchedulerError> {
        let conn = self.conn();
        let row: Option<ExecutionRow> = conn
            .query_row(
                "SELECT task_name, execution_time, next_run_time, status, duration,
                        error_message, retry_count
                 FROM task_executions
                 WHERE task_name = ?1
                 ORDER BY execution_time DESC
                 LIMIT 1",
                params![task_name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        row.map(execution_from_row).transpose()
    }

    pub fn deactivate_task(&self, task_name: &str, now: NaiveDateTime) -> Result<(), SchedulerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE task_schedules SET is_active = 0, last_updated = ?2
             WHERE task_name = ?1",
            params![task_name, format_timestamp(now)],
        )?;
        Ok(())
    }

    /// Delete execution rows older than the retention horizon. Returns
    /// the number of rows removed.
    pub fn cleanup_old_executions(
        &self,
        now: NaiveDateTime,
        days_to_keep: u32,
    ) -> Result<usize, SchedulerError> {
        let cutoff = truncate_to_seconds(now) - Duration::days(i64::from(days_to_keep));
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM task_executions WHERE execution_time < ?1",
            params![format_timestamp(cutoff)],
        )?;
        Ok(removed)
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>, SchedulerError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM scheduler_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(
        &self,
        key: &str,
        value: &str,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO scheduler_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)",
            params![key, value, format_timestamp(now)],
        )?;
        Ok(())
    }
}

fn schedule_from_row(row: ScheduleRow) -> Result<TaskSchedule, SchedulerError> {
    let (task_name, next_run_time, schedule_config, last_updated, is_active) = row;
    Ok(TaskSchedule {
        task_name,
        next_run_time: parse_timestamp(&next_run_time)?,
        schedule_config,
        last_updated: parse_timestamp(&last_updated)?,
        is_active,
    })
}

fn execution_from_row(row: ExecutionRow) -> Result<TaskExecutionRecord, SchedulerError> {
    let (task_name, execution_time, next_run_time, status, duration, error_message, retry_count) =
        row;
    Ok(TaskExecutionRecord {
        task_name,
        execution_time: parse_timestamp(&execution_time)?,
        next_run_time: next_run_time.as_deref().map(parse_timestamp).transpose()?,
        status: status.parse::<ExecutionStatus>()?,
        duration,
        error_message,
        retry_count,
    })
}
