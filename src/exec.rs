use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// A program plus its arguments, executed without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` did not finish within {}", describe_timeout(.timeout))]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with {}", describe_exit_code(.code))]
    ExitStatus { command: String, code: Option<i32> },
}

fn describe_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn describe_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

pub trait CommandRunner {
    /// Runs the command and returns its stdout with trailing whitespace removed.
    async fn run(&self, command: &CommandLine) -> Result<String, ExecutionError>;

    /// Same as [`CommandRunner::run`], but any failure becomes `None`.
    async fn run_best_effort(&self, command: &CommandLine) -> Option<String> {
        match self.run(command).await {
            Ok(text) => Some(text),
            Err(err) => {
                debug!(error = %err, "best-effort command failed");
                None
            }
        }
    }
}

/// Spawns real subprocesses, each bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, command: &CommandLine) -> Result<String, ExecutionError> {
        let rendered = command.to_string();
        debug!(command = %rendered, "running");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ExecutionError::Spawn {
                    command: rendered,
                    source,
                })
            }
            Err(_elapsed) => {
                return Err(ExecutionError::Timeout {
                    command: rendered,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            debug!(
                command = %rendered,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "command exited unsuccessfully"
            );
            return Err(ExecutionError::ExitStatus {
                command: rendered,
                code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}
