use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tracing::{debug, error, info, warn};

use task_runner::DependencyProvisioner;

use crate::config::{Config, ConfigWatcher};
use crate::memory::{current_usage, MemoryMonitor, MemoryUsage};
use crate::task_parser::{self, TaskFile};

use super::executor::TaskExecutor;
use super::reconcile::reconcile;
use super::registry::{JobRegistry, ScheduledJob};
use super::store::SqliteStore;
use super::tracker::ExecutionTracker;
use super::types::{format_timestamp, truncate_to_seconds, SchedulerError, TaskSchedule};

const CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const STATE_RUNNING: &str = "running";
const STATE_LAST_STARTED_AT: &str = "last_started_at";

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub loaded_tasks: usize,
    pub scheduled_jobs: usize,
    pub memory: MemoryUsage,
}

/// The scheduler loop driver. Owns every scheduling component; task
/// bodies run synchronously on the loop thread through the executor.
pub struct Scheduler<E: TaskExecutor> {
    config: Config,
    config_watcher: ConfigWatcher,
    pub(super) store: SqliteStore,
    pub(super) registry: JobRegistry,
    pub(super) tracker: ExecutionTracker,
    executor: E,
    provisioner: DependencyProvisioner,
    memory: MemoryMonitor,
    loaded_tasks: HashMap<String, TaskFile>,
    running: bool,
    restart_requested: bool,
    stop: Arc<AtomicBool>,
}

impl<E: TaskExecutor> Scheduler<E> {
    pub fn new(config_path: impl Into<PathBuf>, executor: E) -> Result<Self, SchedulerError> {
        let config_path = config_path.into();
        let config = Config::load(&config_path)?;
        let config_watcher = ConfigWatcher::new(&config_path);

        std::fs::create_dir_all(&config.tasks.directory)?;
        let store = SqliteStore::new(&config.database.path)?;
        let provisioner = DependencyProvisioner::new(config.provisioner.pip_executable.clone());
        let memory = MemoryMonitor::new(config.scheduler.max_memory_usage);

        Ok(Self {
            config,
            config_watcher,
            store,
            registry: JobRegistry::new(),
            tracker: ExecutionTracker::new(),
            executor,
            provisioner,
            memory,
            loaded_tasks: HashMap::new(),
            running: false,
            restart_requested: false,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag shared with signal handlers; setting it stops the loop
    /// within a second.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Run until stopped. Returns true when the loop exited because a
    /// restart was requested; the caller is expected to build a fresh
    /// scheduler in that case.
    pub fn start(&mut self) -> Result<bool, SchedulerError> {
        info!("starting task scheduler");
        let now = truncate_to_seconds(Local::now().naive_local());
        self.store.set_state(STATE_RUNNING, "true", now)?;
        self.store
            .set_state(STATE_LAST_STARTED_AT, &format_timestamp(now), now)?;

        self.memory.start();
        self.scan_and_load_tasks(now);

        self.running = true;
        self.main_loop();
        self.running = false;

        self.memory.stop();
        let now = truncate_to_seconds(Local::now().naive_local());
        if let Err(err) = self.store.set_state(STATE_RUNNING, "false", now) {
            warn!("failed to persist stopped state: {}", err);
        }
        info!("task scheduler stopped");
        Ok(self.restart_requested)
    }

    fn main_loop(&mut self) {
        let mut last_config_check = Instant::now();
        let mut last_task_scan = Instant::now();
        let mut last_housekeeping = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            let now = truncate_to_seconds(Local::now().naive_local());

            if last_config_check.elapsed() >= CONFIG_CHECK_INTERVAL {
                self.check_and_reload_config();
                last_config_check = Instant::now();
            }

            let task_check = Duration::from_secs(self.config.scheduler.task_check_interval);
            if last_task_scan.elapsed() >= task_check {
                self.scan_and_load_tasks(now);
                last_task_scan = Instant::now();
            }

            self.run_due_jobs(now);

            if let Err(err) = reconcile(
                &self.store,
                &mut self.registry,
                &mut self.tracker,
                &self.executor,
                now,
            ) {
                error!("reconciliation pass failed: {}", err);
            }

            let cleanup = Duration::from_secs(self.config.scheduler.memory_cleanup_interval);
            if last_housekeeping.elapsed() >= cleanup {
                self.housekeeping(now);
                last_housekeeping = Instant::now();
            }

            if self.memory.is_usage_high() {
                warn!("high memory usage detected, requesting restart");
                self.restart_requested = true;
                break;
            }

            // Stop-aware sleep at one second granularity.
            for _ in 0..self.config.scheduler.loop_interval {
                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        info!("main loop stopped");
    }

    /// Aligned jobs first, then delegated jobs; within each kind the
    /// most overdue job runs first. Failures are logged per job.
    pub(super) fn run_due_jobs(&mut self, now: NaiveDateTime) {
        let due = self.registry.due_task_names(now);
        for aligned_pass in [true, false] {
            for task_name in &due {
                let is_aligned = match self.registry.find_job(task_name) {
                    Some(job) => job.slot.is_aligned(),
                    None => continue,
                };
                if is_aligned != aligned_pass {
                    continue;
                }
                if let Some(job) = self.registry.find_job_mut(task_name) {
                    if let Err(err) = self.tracker.run_job(&self.store, &self.executor, job, now)
                    {
                        error!("error running scheduled task {}: {}", task_name, err);
                    }
                }
            }
        }
    }

    fn check_and_reload_config(&mut self) {
        let Some(new_config) = self.config_watcher.reload_if_changed() else {
            return;
        };

        if new_config.scheduler.max_memory_usage != self.config.scheduler.max_memory_usage {
            info!(
                "memory usage limit changed to {} MB",
                new_config.scheduler.max_memory_usage
            );
            self.memory.set_limit_mb(new_config.scheduler.max_memory_usage);
        }
        if new_config.tasks.directory != self.config.tasks.directory {
            info!(
                "tasks directory changed from {} to {}",
                self.config.tasks.directory.display(),
                new_config.tasks.directory.display()
            );
            if let Err(err) = std::fs::create_dir_all(&new_config.tasks.directory) {
                error!("failed to create new tasks directory: {}", err);
            }
        }
        if new_config.provisioner != self.config.provisioner {
            info!("provisioner settings changed, recreating provisioner");
            self.provisioner =
                DependencyProvisioner::new(new_config.provisioner.pip_executable.clone());
        }
        if new_config.database.path != self.config.database.path {
            warn!("database path change takes effect on the next restart");
        }
        self.config = new_config;
        debug!("configuration reloaded");
    }

    pub(super) fn scan_and_load_tasks(&mut self, now: NaiveDateTime) {
        debug!("scanning tasks directory");
        let task_files = task_parser::scan(
            &self.config.tasks.directory,
            self.config.tasks.include_example_tasks,
        );
        let total_files = task_files.len();

        let mut current: HashSet<String> = HashSet::new();
        for task_file in task_files {
            let task_name = task_file.definition.name.clone();
            current.insert(task_name.clone());

            let needs_reload = match self.loaded_tasks.get(&task_name) {
                Some(loaded) => loaded.file_hash != task_file.file_hash,
                None => true,
            };
            if needs_reload {
                if let Err(err) = self.load_task(task_file, now) {
                    error!("error loading task {}: {}", task_name, err);
                }
            }
        }

        let removed: Vec<String> = self
            .loaded_tasks
            .keys()
            .filter(|name| !current.contains(*name))
            .cloned()
            .collect();
        for task_name in removed {
            self.unload_task(&task_name, now);
        }

        info!(
            "task scan completed: {} files, {} active",
            total_files,
            current.len()
        );
    }

    fn load_task(&mut self, task_file: TaskFile, now: NaiveDateTime) -> Result<(), SchedulerError> {
        let task_name = task_file.definition.name.clone();
        info!("loading task: {}", task_name);

        if !task_file.definition.dependencies.is_empty() {
            self.provisioner
                .ensure_installed(&task_file.definition.dependencies)
                .map_err(|err| {
                    SchedulerError::TaskLoad(format!(
                        "dependency install failed for {}: {}",
                        task_name, err
                    ))
                })?;
        }

        if self.loaded_tasks.contains_key(&task_name) {
            self.registry.unregister(&task_name);
        }

        let job = ScheduledJob::new(task_file.definition.clone(), now)?;
        let next_run = job.slot.next_run();
        let schedule_config = job.schedule_config.clone();
        self.registry.register(job)?;

        if self.store.get_schedule(&task_name)?.is_none() {
            self.store.upsert_schedule(&TaskSchedule {
                task_name: task_name.clone(),
                next_run_time: next_run,
                schedule_config,
                last_updated: now,
                is_active: true,
            })?;
            info!(
                "initial schedule recorded for task {}: next run at {}",
                task_name, next_run
            );
        }

        self.loaded_tasks.insert(task_name, task_file);
        Ok(())
    }

    pub(super) fn unload_task(&mut self, task_name: &str, now: NaiveDateTime) {
        info!("unloading task: {}", task_name);
        self.registry.unregister(task_name);
        self.loaded_tasks.remove(task_name);
        if let Err(err) = self.store.deactivate_task(task_name, now) {
            error!("failed to deactivate schedule for {}: {}", task_name, err);
        }
    }

    fn housekeeping(&mut self, now: NaiveDateTime) {
        debug!("running housekeeping");
        self.memory.log_usage();
        let retention_days = self.config.scheduler.execution_retention_days;
        match self.store.cleanup_old_executions(now, retention_days) {
            Ok(0) => {}
            Ok(removed) => info!(
                "purged {} execution records older than {} days",
                removed, retention_days
            ),
            Err(err) => error!("execution history cleanup failed: {}", err),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = match self.store.get_state(STATE_RUNNING) {
            Ok(Some(value)) => value == "true",
            _ => self.running,
        };
        SchedulerStatus {
            running,
            loaded_tasks: self.loaded_tasks.len(),
            scheduled_jobs: self.registry.len(),
            memory: current_usage().unwrap_or_default(),
        }
    }
}
