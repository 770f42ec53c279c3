//! Workload command assembly and process lifecycle.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sandbox::{Activation, SandboxError};
use serde_json::Value;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::trace::TraceError;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("parameters must be a mapping or a list, got {kind}")]
    InvalidParameters { kind: &'static str },

    #[error("Sandbox could not be built")]
    Sandbox(#[from] SandboxError),

    #[error("Tracing failed")]
    Tracing(#[from] TraceError),

    #[error("Failed to start workload: {message}")]
    Spawn { message: String },

    #[error("Failed to wait for workload: {message}")]
    Wait { message: String },

    #[error("Failed to serialize telemetry: {message}")]
    Telemetry { message: String },
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Append task parameters to the base command.
///
/// A mapping is passed as one single-quoted JSON argument. List elements are
/// appended space separated, strings verbatim and anything else as JSON.
/// Absent, null or empty parameters leave the command unchanged.
pub fn assemble_command(base: &str, parameters: Option<&Value>) -> Result<String, ExecutionError> {
    match parameters {
        None | Some(Value::Null) => Ok(base.to_string()),
        Some(Value::Object(map)) if map.is_empty() => Ok(base.to_string()),
        Some(Value::Array(items)) if items.is_empty() => Ok(base.to_string()),
        Some(mapping @ Value::Object(_)) => Ok(format!("{} '{}'", base, mapping)),
        Some(Value::Array(items)) => {
            let mut command = base.to_string();
            for item in items {
                command.push(' ');
                match item {
                    Value::String(s) => command.push_str(s),
                    other => command.push_str(&other.to_string()),
                }
            }
            Ok(command)
        }
        Some(other) => Err(ExecutionError::InvalidParameters {
            kind: kind_of(other),
        }),
    }
}

/// What a finished workload left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadOutcome {
    /// Exit code, or the negated signal number when killed by a signal.
    pub return_code: i32,
    pub std_out: String,
    pub std_err: String,
}

/// A shell command plus the confinement applied to it before exec.
#[derive(Debug, Clone)]
pub struct Workload {
    command: String,
    activation: Activation,
    stop_on_spawn: bool,
}

impl Workload {
    pub fn new(command: impl Into<String>, activation: Activation) -> Self {
        Self {
            command: command.into(),
            activation,
            stop_on_spawn: false,
        }
    }

    /// SIGSTOP the workload as soon as it is spawned so a tracer can attach.
    pub fn stop_on_spawn(mut self, stop: bool) -> Self {
        self.stop_on_spawn = stop;
        self
    }

    /// Start `/bin/sh -c <command>` with stdout and stderr captured.
    pub fn spawn(&self) -> Result<RunningWorkload, ExecutionError> {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !self.activation.is_noop() {
            let activation = self.activation.clone();
            // SAFETY: activation only issues setrlimit and prctl/seccomp
            // syscalls on data prepared in the parent.
            unsafe {
                command.pre_exec(move || activation.activate().map_err(io::Error::from));
            }
        }

        let child = command.spawn().map_err(|e| ExecutionError::Spawn {
            message: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ExecutionError::Spawn {
            message: "workload exited before its pid was read".to_string(),
        })?;

        if self.stop_on_spawn {
            let raw = i32::try_from(pid).map_err(|e| ExecutionError::Spawn {
                message: e.to_string(),
            })?;
            kill(Pid::from_raw(raw), Signal::SIGSTOP).map_err(|e| ExecutionError::Spawn {
                message: format!("could not stop workload {}: {}", pid, e),
            })?;
            debug!(pid, "Workload stopped for tracer attach");
        }

        info!(pid, command = %self.command, "Workload started");
        Ok(RunningWorkload { child, pid })
    }
}

#[derive(Debug)]
pub struct RunningWorkload {
    child: Child,
    pid: u32,
}

impl RunningWorkload {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for exit, collecting everything written to stdout and stderr.
    pub async fn wait(self) -> Result<WorkloadOutcome, ExecutionError> {
        let output = self
            .child
            .wait_with_output()
            .await
            .map_err(|e| ExecutionError::Wait {
                message: e.to_string(),
            })?;

        let return_code = output
            .status
            .code()
            .unwrap_or_else(|| -output.status.signal().unwrap_or(0));
        info!(pid = self.pid, return_code, "Workload exited");

        Ok(WorkloadOutcome {
            return_code,
            std_out: String::from_utf8_lossy(&output.stdout).into_owned(),
            std_err: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Kill and reap a workload that will not be run to completion.
    pub async fn abort(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "Failed to kill workload");
        }
    }
}
