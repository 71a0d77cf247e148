use std::io;
use std::process::Command;

use tracing::debug;

use super::errors::RunTaskError;
use super::types::{RunTaskOutput, RunTaskParams};

const OUTPUT_TAIL_LEN: usize = 2000;

/// Execute one task body as a child process and wait for it to finish.
///
/// Stdout and stderr are captured together; only the tail is kept so a
/// chatty task cannot blow up execution records. A non-zero exit status
/// is an error and the scheduler records it as a failed execution.
pub fn run_task(params: &RunTaskParams) -> Result<RunTaskOutput, RunTaskError> {
    let mut cmd = Command::new(&params.command);
    cmd.args(&params.args);
    if let Some(dir) = &params.working_dir {
        cmd.current_dir(dir);
    }

    debug!(
        "running task command: {} {:?} (task {})",
        params.command, params.args, params.task_name
    );

    let output = match cmd.output() {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(RunTaskError::CommandNotFound {
                command: params.command.clone(),
            });
        }
        Err(err) => return Err(err.into()),
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    let output_tail = tail_string(&combined, OUTPUT_TAIL_LEN);

    if !output.status.success() {
        return Err(RunTaskError::CommandFailed {
            status: output.status.code(),
            output: output_tail,
        });
    }

    Ok(RunTaskOutput {
        status: output.status.code(),
        output_tail,
    })
}

pub(super) fn tail_string(input: &str, max_len: usize) -> String {
    let trimmed = input.trim();
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut start = trimmed.len().saturating_sub(max_len);
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
