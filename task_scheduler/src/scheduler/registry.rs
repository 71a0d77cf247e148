use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use cron::Schedule as CronSchedule;

use crate::task_parser::{ScheduleSpec, TaskDefinition};

use super::interval::{next_aligned, IntervalUnit};
use super::types::{truncate_to_seconds, SchedulerError};

/// Clock-aligned job: runs at multiples of the interval snapped to
/// minute/hour/day boundaries.
#[derive(Debug, Clone)]
pub struct AlignedJob {
    pub interval: u32,
    pub unit: IntervalUnit,
    pub next_run: NaiveDateTime,
    pub last_run: Option<NaiveDateTime>,
}

impl AlignedJob {
    pub fn new(
        interval: u32,
        unit: IntervalUnit,
        now: NaiveDateTime,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            interval,
            unit,
            next_run: next_aligned(now, interval, unit)?,
            last_run: None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum DelegatedRule {
    EverySeconds(u64),
    Calendar(CronSchedule),
}

/// Job whose cadence is not clock-aligned: a free-running interval in
/// seconds, or a calendar rule (weekday and time of day) handled by the
/// cron schedule parser.
#[derive(Debug, Clone)]
pub struct DelegatedJob {
    pub rule: DelegatedRule,
    pub next_run: NaiveDateTime,
    pub last_run: Option<NaiveDateTime>,
}

impl DelegatedJob {
    pub fn new(rule: DelegatedRule, now: NaiveDateTime) -> Result<Self, SchedulerError> {
        let next_run = delegated_next_run(&rule, now)?;
        Ok(Self {
            rule,
            next_run,
            last_run: None,
        })
    }
}

fn delegated_next_run(
    rule: &DelegatedRule,
    now: NaiveDateTime,
) -> Result<NaiveDateTime, SchedulerError> {
    match rule {
        DelegatedRule::EverySeconds(seconds) => {
            Ok(truncate_to_seconds(now) + Duration::seconds(*seconds as i64))
        }
        DelegatedRule::Calendar(schedule) => schedule
            .after(&Utc.from_utc_datetime(&now))
            .next()
            .map(|instant| instant.naive_utc())
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule("calendar rule yields no upcoming run".to_string())
            }),
    }
}

pub(crate) fn calendar_rule(
    weekday: Option<chrono::Weekday>,
    at: chrono::NaiveTime,
) -> Result<DelegatedRule, SchedulerError> {
    use chrono::Timelike;
    let dow = match weekday {
        Some(chrono::Weekday::Mon) => "MON",
        Some(chrono::Weekday::Tue) => "TUE",
        Some(chrono::Weekday::Wed) => "WED",
        Some(chrono::Weekday::Thu) => "THU",
        Some(chrono::Weekday::Fri) => "FRI",
        Some(chrono::Weekday::Sat) => "SAT",
        Some(chrono::Weekday::Sun) => "SUN",
        None => "*",
    };
    let expression = format!("0 {} {} * * {}", at.minute(), at.hour(), dow);
    Ok(DelegatedRule::Calendar(CronSchedule::from_str(&expression)?))
}

#[derive(Debug, Clone)]
pub enum JobSlot {
    Aligned(AlignedJob),
    Delegated(DelegatedJob),
}

impl JobSlot {
    pub fn from_spec(spec: &ScheduleSpec, now: NaiveDateTime) -> Result<Self, SchedulerError> {
        match spec {
            ScheduleSpec::Aligned { every, unit } => {
                Ok(JobSlot::Aligned(AlignedJob::new(*every, *unit, now)?))
            }
            ScheduleSpec::EverySeconds { seconds } => Ok(JobSlot::Delegated(DelegatedJob::new(
                DelegatedRule::EverySeconds(*seconds),
                now,
            )?)),
            ScheduleSpec::Calendar { weekday, at } => Ok(JobSlot::Delegated(DelegatedJob::new(
                calendar_rule(*weekday, *at)?,
                now,
            )?)),
        }
    }

    pub fn next_run(&self) -> NaiveDateTime {
        match self {
            JobSlot::Aligned(job) => job.next_run,
            JobSlot::Delegated(job) => job.next_run,
        }
    }

    pub fn should_run(&self, now: NaiveDateTime) -> bool {
        now >= self.next_run()
    }

    /// Record a run at `now` and recompute the next run time.
    pub fn advance(&mut self, now: NaiveDateTime) -> Result<NaiveDateTime, SchedulerError> {
        match self {
            JobSlot::Aligned(job) => {
                job.last_run = Some(now);
                job.next_run = next_aligned(now, job.interval, job.unit)?;
                Ok(job.next_run)
            }
            JobSlot::Delegated(job) => {
                job.last_run = Some(now);
                job.next_run = delegated_next_run(&job.rule, now)?;
                Ok(job.next_run)
            }
        }
    }

    pub fn is_aligned(&self) -> bool {
        matches!(self, JobSlot::Aligned(_))
    }
}

/// A live scheduled job: the parsed task definition plus its schedule
/// slot. Rebuilt from the task directory on every start and scan pass,
/// never persisted.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub task: TaskDefinition,
    pub slot: JobSlot,
    pub schedule_config: String,
}

impl ScheduledJob {
    pub fn new(task: TaskDefinition, now: NaiveDateTime) -> Result<Self, SchedulerError> {
        let slot = JobSlot::from_spec(&task.schedule, now)?;
        let schedule_config = task.schedule.describe();
        Ok(Self {
            task,
            slot,
            schedule_config,
        })
    }

    pub fn task_name(&self) -> &str {
        &self.task.name
    }
}

/// In-memory mapping from task names to their live jobs. Linear scans
/// are fine at the tens-to-hundreds task counts this serves.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Vec<ScheduledJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a second live registration for the same task name; the
    /// old job must be unregistered first.
    pub fn register(&mut self, job: ScheduledJob) -> Result<(), SchedulerError> {
        if self.find_job(job.task_name()).is_some() {
            return Err(SchedulerError::DuplicateTask(job.task_name().to_string()));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn find_job(&self, task_name: &str) -> Option<&ScheduledJob> {
        self.jobs.iter().find(|job| job.task_name() == task_name)
    }

    pub fn find_job_mut(&mut self, task_name: &str) -> Option<&mut ScheduledJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.task_name() == task_name)
    }

    pub fn unregister(&mut self, task_name: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.task_name() != task_name);
        self.jobs.len() != before
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Names of jobs due at `now`, sorted by next run time so the most
    /// overdue job goes first.
    pub fn due_task_names(&self, now: NaiveDateTime) -> Vec<String> {
        let mut due: Vec<(&ScheduledJob, NaiveDateTime)> = self
            .jobs
            .iter()
            .filter(|job| job.slot.should_run(now))
            .map(|job| (job, job.slot.next_run()))
            .collect();
        due.sort_by_key(|(_, next_run)| *next_run);
        due.into_iter()
            .map(|(job, _)| job.task_name().to_string())
            .collect()
    }
}
