use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything needed to execute one task body as a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskParams {
    pub task_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Declarative only; execution is not cancelled when exceeded.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RunTaskOutput {
    pub status: Option<i32>,
    pub output_tail: String,
}
