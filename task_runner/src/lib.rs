mod run_task;

pub use run_task::deps::DependencyProvisioner;
pub use run_task::errors::RunTaskError;
pub use run_task::run_task;
pub use run_task::types::{RunTaskOutput, RunTaskParams};
