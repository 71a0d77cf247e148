mod core;
mod executor;
mod interval;
mod reconcile;
mod registry;
mod store;
mod tracker;
mod types;

pub use core::{Scheduler, SchedulerStatus};
pub use executor::{CommandExecutor, TaskExecutor};
pub use interval::{next_aligned, IntervalUnit};
pub use reconcile::reconcile;
pub use registry::{AlignedJob, DelegatedJob, DelegatedRule, JobRegistry, JobSlot, ScheduledJob};
pub use store::SqliteStore;
pub use tracker::{ExecutionTracker, RunOutcome};
pub use types::{ExecutionStatus, SchedulerError, TaskExecutionRecord, TaskSchedule};

#[cfg(test)]
mod tests;
