use thiserror::Error;

use std::io;
use std::process::{Command, Output};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command execution failed")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// log errors and warnings or suppress them
#[derive(Clone, Copy, Debug)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> Result<(), Error>;
    fn run_stdout(&mut self, logs: Logs) -> Result<String, Error>;
}

impl ShellCommandExt for Command {
    /// Run the command and print stderr with a warning on success.
    /// Unconditionally captures stdout and stderr regardless of command settings.
    fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output()?;
        let stderrempty = output.stderr.is_empty();
        match (stderrempty, output.status) {
            (true, status) if status.success() => Ok(()),
            (false, status) if status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::warn!(cmd = ?self, %stderr, "Non empty stderr on successful command");
                }
                Ok(())
            }
            (_, status) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::error!(cmd = ?self, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
                }
                Err(Error::CommandFailed)
            }
        }
    }

    fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output()?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stderrempty = output.stderr.is_empty();
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderrempty, output.status) {
        (true, status) if status.success() => Ok(stdout.trim().to_string()),
        (false, status) if status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::warn!(cmd, %stderr, "Non empty stderr on successful command");
            }
            Ok(stdout.trim().to_string())
        }
        (_, status) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
            }
            Err(Error::CommandFailed)
        }
    }
}
