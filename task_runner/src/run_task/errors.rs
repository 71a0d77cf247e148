use std::fmt;
use std::io;

#[derive(Debug)]
pub enum RunTaskError {
    Io(io::Error),
    CommandNotFound {
        command: String,
    },
    CommandFailed {
        status: Option<i32>,
        output: String,
    },
    InstallerNotFound {
        command: String,
    },
    InstallFailed {
        packages: Vec<String>,
        output: String,
    },
    PackageListFailed {
        output: String,
    },
}

impl fmt::Display for RunTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTaskError::Io(err) => write!(f, "I/O error: {}", err),
            RunTaskError::CommandNotFound { command } => {
                write!(f, "Task command not found on PATH: {}", command)
            }
            RunTaskError::CommandFailed { status, output } => write!(
                f,
                "Task command failed (status: {:?}). Output tail:\n{}",
                status, output
            ),
            RunTaskError::InstallerNotFound { command } => {
                write!(f, "Package installer not found on PATH: {}", command)
            }
            RunTaskError::InstallFailed { packages, output } => write!(
                f,
                "Failed to install packages {:?}. Output tail:\n{}",
                packages, output
            ),
            RunTaskError::PackageListFailed { output } => {
                write!(f, "Failed to list installed packages:\n{}", output)
            }
        }
    }
}

impl std::error::Error for RunTaskError {}

impl From<io::Error> for RunTaskError {
    fn from(err: io::Error) -> Self {
        RunTaskError::Io(err)
    }
}
