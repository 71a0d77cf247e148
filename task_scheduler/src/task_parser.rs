//! Task discovery: declarative TOML task files.
//!
//! A task file names the command to run and how often to run it:
//!
//! ```toml
//! title = "Nightly backup"
//! dependencies = ["requests==2.31.0"]
//!
//! [schedule]
//! every = 5
//! unit = "minutes"
//!
//! [run]
//! command = "sh"
//! args = ["-c", "backup.sh"]
//! ```
//!
//! The `[schedule]` table accepts exactly one form: `every` + `unit`
//! (clock-aligned), `every_seconds` (free-running), or `at` with an
//! optional `weekday` (calendar rule).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use tracing::{debug, error};

use crate::scheduler::{IntervalUnit, SchedulerError};

#[derive(Debug, Deserialize)]
struct TaskManifest {
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    retry_count: u32,
    #[serde(default = "default_retry_delay")]
    retry_delay: u64,
    schedule: ScheduleTable,
    run: RunSpec,
}

#[derive(Debug, Deserialize)]
struct ScheduleTable {
    every: Option<u32>,
    unit: Option<String>,
    every_seconds: Option<u64>,
    weekday: Option<String>,
    at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    300
}

fn default_retry_delay() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    Aligned { every: u32, unit: IntervalUnit },
    EverySeconds { seconds: u64 },
    Calendar { weekday: Option<Weekday>, at: NaiveTime },
}

impl ScheduleSpec {
    fn from_table(table: &ScheduleTable) -> Result<Self, SchedulerError> {
        match (
            table.every,
            table.unit.as_deref(),
            table.every_seconds,
            table.at.as_deref(),
        ) {
            (Some(every), Some(unit), None, None) => {
                if every == 0 {
                    return Err(SchedulerError::ZeroInterval);
                }
                if table.weekday.is_some() {
                    return Err(SchedulerError::InvalidSchedule(
                        "weekday is only valid with at".to_string(),
                    ));
                }
                Ok(ScheduleSpec::Aligned {
                    every,
                    unit: unit.parse()?,
                })
            }
            (None, None, Some(seconds), None) => {
                if seconds == 0 {
                    return Err(SchedulerError::ZeroInterval);
                }
                if table.weekday.is_some() {
                    return Err(SchedulerError::InvalidSchedule(
                        "weekday is only valid with at".to_string(),
                    ));
                }
                Ok(ScheduleSpec::EverySeconds { seconds })
            }
            (None, None, None, Some(at)) => {
                let at = NaiveTime::parse_from_str(at, "%H:%M").map_err(|_| {
                    SchedulerError::InvalidSchedule(format!("bad at time: {}", at))
                })?;
                let weekday = table
                    .weekday
                    .as_deref()
                    .map(parse_weekday)
                    .transpose()?;
                Ok(ScheduleSpec::Calendar { weekday, at })
            }
            _ => Err(SchedulerError::InvalidSchedule(
                "schedule must be exactly one of every+unit, every_seconds, or at [+ weekday]"
                    .to_string(),
            )),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ScheduleSpec::Aligned { every, unit } => format!("every {} {}", every, unit),
            ScheduleSpec::EverySeconds { seconds } => format!("every {} seconds", seconds),
            ScheduleSpec::Calendar {
                weekday: Some(day),
                at,
            } => format!("{}s at {}", weekday_name(*day), at.format("%H:%M")),
            ScheduleSpec::Calendar { weekday: None, at } => {
                format!("daily at {}", at.format("%H:%M"))
            }
        }
    }
}

fn parse_weekday(raw: &str) -> Result<Weekday, SchedulerError> {
    Weekday::from_str(raw)
        .map_err(|_| SchedulerError::InvalidSchedule(format!("bad weekday: {}", raw)))
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub title: String,
    pub description: String,
    pub enabled: bool,
    pub dependencies: Vec<String>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
    pub schedule: ScheduleSpec,
    pub run: RunSpec,
}

#[derive(Debug, Clone)]
pub struct TaskFile {
    pub path: PathBuf,
    pub definition: TaskDefinition,
    pub file_hash: String,
}

pub fn parse_file(path: &Path) -> Result<TaskFile, SchedulerError> {
    let raw = std::fs::read_to_string(path)?;
    let file_hash = format!("{:x}", md5::compute(raw.as_bytes()));
    let manifest: TaskManifest = toml::from_str(&raw)?;

    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| SchedulerError::TaskLoad(format!("bad task file name: {}", path.display())))?
        .to_string();
    let schedule = ScheduleSpec::from_table(&manifest.schedule)?;

    Ok(TaskFile {
        path: path.to_path_buf(),
        definition: TaskDefinition {
            title: manifest.title.unwrap_or_else(|| name.clone()),
            name,
            description: manifest.description,
            enabled: manifest.enabled,
            dependencies: manifest.dependencies,
            timeout_secs: manifest.timeout,
            retry_count: manifest.retry_count,
            retry_delay_secs: manifest.retry_delay,
            schedule,
            run: manifest.run,
        },
        file_hash,
    })
}

/// Scan a directory for `*.toml` task files. Parse failures are logged
/// and the file is skipped; one bad task never blocks the others.
/// Disabled tasks and, when excluded, `example_`-prefixed tasks are
/// filtered out.
pub fn scan(tasks_dir: &Path, include_example_tasks: bool) -> Vec<TaskFile> {
    let mut task_files = Vec::new();
    let entries = match std::fs::read_dir(tasks_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("tasks directory {} not readable: {}", tasks_dir.display(), err);
            return task_files;
        }
    };

    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                error!("failed to read tasks directory entry: {}", err);
                continue;
            }
        };
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        if stem.starts_with("example_") && !include_example_tasks {
            continue;
        }
        match parse_file(&path) {
            Ok(task_file) => {
                if task_file.definition.enabled {
                    task_files.push(task_file);
                }
            }
            Err(err) => {
                error!("failed to parse task file {}: {}", path.display(), err);
            }
        }
    }

    task_files.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
    task_files
}
