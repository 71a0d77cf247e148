use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::scheduler::SchedulerError;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between task directory rescans.
    pub task_check_interval: u64,
    /// Seconds between housekeeping passes.
    pub memory_cleanup_interval: u64,
    /// Seconds between ticks.
    pub loop_interval: u64,
    /// RSS ceiling in megabytes; crossing it requests a restart.
    pub max_memory_usage: u64,
    pub execution_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_check_interval: 60,
            memory_cleanup_interval: 300,
            loop_interval: 10,
            max_memory_usage: 500,
            execution_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/scheduler.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TasksConfig {
    pub directory: PathBuf,
    pub include_example_tasks: bool,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("tasks"),
            include_example_tasks: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub pip_executable: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            pip_executable: "pip3".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, SchedulerError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Watches the config file by mtime. A failed reload keeps the previous
/// config active.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            last_modified,
        }
    }

    /// Returns the freshly loaded config when the file changed and
    /// parsed cleanly, `None` otherwise.
    pub fn reload_if_changed(&mut self) -> Option<Config> {
        let current = modified_time(&self.path)?;
        if Some(current) == self.last_modified {
            return None;
        }
        info!("config file changed, reloading");
        match Config::load(&self.path) {
            Ok(config) => {
                self.last_modified = Some(current);
                Some(config)
            }
            Err(err) => {
                error!("failed to reload config, keeping previous: {}", err);
                // Remember the mtime anyway so a broken file is not
                // re-parsed every pass until it changes again.
                self.last_modified = Some(current);
                None
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    match std::fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => Some(modified),
        Err(err) => {
            debug!("cannot stat config {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str("").expect("empty config");
        assert_eq!(config.scheduler.task_check_interval, 60);
        assert_eq!(config.scheduler.loop_interval, 10);
        assert_eq!(config.scheduler.max_memory_usage, 500);
        assert_eq!(config.scheduler.execution_retention_days, 30);
        assert_eq!(config.database.path, PathBuf::from("data/scheduler.db"));
        assert!(config.tasks.include_example_tasks);
        assert_eq!(config.provisioner.pip_executable, "pip3");
    }

    #[test]
    fn load_reads_overrides() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[scheduler]\nloop_interval = 2\nmax_memory_usage = 128\n\n[tasks]\ndirectory = \"jobs\"\ninclude_example_tasks = false\n",
        )
        .expect("write config");

        let config = Config::load(&path).expect("load");
        assert_eq!(config.scheduler.loop_interval, 2);
        assert_eq!(config.scheduler.max_memory_usage, 128);
        assert_eq!(config.tasks.directory, PathBuf::from("jobs"));
        assert!(!config.tasks.include_example_tasks);
    }

    #[test]
    fn watcher_keeps_previous_config_on_bad_reload() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[scheduler]\nloop_interval = 2\n").expect("write config");

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.reload_if_changed().is_none());

        fs::write(&path, "not [valid toml").expect("overwrite config");
        // Force a different mtime in case the writes land in the same tick.
        let future = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = fs::File::open(&path).expect("open");
        file.set_modified(future).expect("set mtime");
        assert!(watcher.reload_if_changed().is_none());

        fs::write(&path, "[scheduler]\nloop_interval = 7\n").expect("fix config");
        let file = fs::File::open(&path).expect("open");
        file.set_modified(future + std::time::Duration::from_secs(2))
            .expect("set mtime");
        let reloaded = watcher.reload_if_changed().expect("reload");
        assert_eq!(reloaded.scheduler.loop_interval, 7);
    }
}
