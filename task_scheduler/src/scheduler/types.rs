use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};

/// Stored timestamp layout, second precision. Sub-second components are
/// truncated before anything is written or compared.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub(crate) fn truncate_to_seconds(value: NaiveDateTime) -> NaiveDateTime {
    value.with_nanosecond(0).unwrap_or(value)
}

pub(crate) fn format_timestamp(value: NaiveDateTime) -> String {
    truncate_to_seconds(value)
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, SchedulerError> {
    Ok(NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)?)
}

/// Durable per-task schedule row. At most one row per task name; a task
/// whose source disappears is deactivated, never deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSchedule {
    pub task_name: String,
    pub next_run_time: NaiveDateTime,
    pub schedule_config: String,
    pub last_updated: NaiveDateTime,
    pub is_active: bool,
}

/// Append-only execution history row, one per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionRecord {
    pub task_name: String,
    pub execution_time: NaiveDateTime,
    pub next_run_time: Option<NaiveDateTime>,
    pub status: ExecutionStatus,
    pub duration: f64,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl FromStr for ExecutionStatus {
    type Err = SchedulerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(SchedulerError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("cron parse error: {0}")]
    Cron(#[from] cron::error::Error),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("interval must be a positive integer")]
    ZeroInterval,
    #[error("invalid interval unit: {0} (expected minutes, hours or days)")]
    InvalidUnit(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("computed run time out of range")]
    TimeOutOfRange,
    #[error("unknown execution status: {0}")]
    InvalidStatus(String),
    #[error("task {0} is already registered")]
    DuplicateTask(String),
    #[error("task load error: {0}")]
    TaskLoad(String),
    #[error("task execution failed: {0}")]
    TaskFailed(String),
}
