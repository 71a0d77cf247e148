use tracing::debug;

use crate::task_parser::TaskDefinition;

use super::types::SchedulerError;

pub trait TaskExecutor {
    fn execute(&self, task: &TaskDefinition) -> Result<(), SchedulerError>;
}

/// Executes a task's `[run]` command as a child process through the
/// runner crate.
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl TaskExecutor for CommandExecutor {
    fn execute(&self, task: &TaskDefinition) -> Result<(), SchedulerError> {
        let params = task_runner::RunTaskParams {
            task_name: task.name.clone(),
            command: task.run.command.clone(),
            args: task.run.args.clone(),
            working_dir: task.run.working_dir.clone(),
            timeout_secs: Some(task.timeout_secs),
        };
        let output =
            task_runner::run_task(&params).map_err(|err| SchedulerError::TaskFailed(err.to_string()))?;
        if !output.output_tail.is_empty() {
            debug!("task {} output tail: {}", task.name, output.output_tail);
        }
        Ok(())
    }
}
