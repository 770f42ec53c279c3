//! Tracer backends and the raw log they produce.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

use super::{Tier, TraceError, TracingConfig};

/// One line of a tracer log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    ProcessStart {
        pid: u32,
        time: f64,
    },
    ProcessEnd {
        pid: u32,
        time: f64,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        signal: Option<i32>,
    },
    FileAccess {
        pid: u32,
        time: f64,
        filename: String,
        #[serde(default)]
        is_directory: bool,
        #[serde(default)]
        exists: bool,
        syscall: String,
        #[serde(default)]
        result: i64,
    },
    Syscall {
        pid: u32,
        name: String,
        start: f64,
        #[serde(default)]
        end: Option<f64>,
        #[serde(default)]
        result: Option<i64>,
        #[serde(default)]
        arguments: Vec<SyscallArgument>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Everything a tracer recorded, in log order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceLogs {
    pub events: Vec<LogEvent>,
}

impl TraceLogs {
    /// Parse a JSON-lines log. Blank lines are ignored.
    pub fn parse(raw: &str) -> Result<Self, TraceError> {
        let mut events = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(line).map_err(|e| TraceError::InvalidLog {
                line: number + 1,
                message: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn read(path: &Path) -> Result<Self, TraceError> {
        let raw = fs::read_to_string(path).map_err(|e| TraceError::Log {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&raw)
    }
}

/// A process tracer attached to a stopped workload.
///
/// Implementations resume the workload once they are attached. `wait`
/// blocks until tracing is over, so callers run it off the async runtime.
pub trait Tracer: Send {
    fn start(&mut self) -> Result<(), TraceError>;
    fn wait(&mut self) -> Result<(), TraceError>;
    fn is_running(&mut self) -> bool;
    fn logs(&self) -> Result<TraceLogs, TraceError>;
}

/// Runs an external tracer program against a pid and reads back its
/// JSON-lines log.
#[derive(Debug)]
pub struct CommandTracer {
    program: PathBuf,
    pid: u32,
    log_path: PathBuf,
    runtime: bool,
    file_access: Tier,
    syscalls: Tier,
    child: Option<Child>,
    /// Set once the tracer has been reaped, by `wait` or `is_running`.
    exit_status: Option<ExitStatus>,
}

impl CommandTracer {
    pub fn new(program: impl Into<PathBuf>, pid: u32, log_path: impl Into<PathBuf>, config: &TracingConfig) -> Self {
        Self {
            program: program.into(),
            pid,
            log_path: log_path.into(),
            runtime: config.enabled,
            file_access: config.file_access,
            syscalls: config.syscall,
            child: None,
            exit_status: None,
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--pid".into(),
            self.pid.to_string().into(),
            "--log".into(),
            self.log_path.clone().into_os_string(),
        ];
        if self.runtime {
            args.push("--runtime".into());
        }
        if let Some(tier) = self.file_access.flag_value() {
            args.push("--file-access".into());
            args.push(tier.into());
        }
        if let Some(tier) = self.syscalls.flag_value() {
            args.push("--syscalls".into());
            args.push(tier.into());
        }
        args
    }
}

impl Tracer for CommandTracer {
    fn start(&mut self) -> Result<(), TraceError> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).map_err(|e| TraceError::Log {
                path: parent.display().to_string(),
                message: e.to_string(),
            })?;
        }

        let child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| TraceError::Spawn {
                program: self.program.display().to_string(),
                message: e.to_string(),
            })?;

        info!(tracer_pid = child.id(), pid = self.pid, "Tracer attached");
        self.child = Some(child);
        Ok(())
    }

    fn wait(&mut self) -> Result<(), TraceError> {
        let status = match (self.exit_status, self.child.as_mut()) {
            (Some(status), _) => status,
            (None, Some(child)) => {
                let status = child.wait().map_err(|e| TraceError::Spawn {
                    program: self.program.display().to_string(),
                    message: e.to_string(),
                })?;
                debug!(%status, "Tracer exited");
                self.exit_status = Some(status);
                status
            }
            (None, None) => return Ok(()),
        };
        if !status.success() {
            return Err(TraceError::TracerExited {
                status: status.to_string(),
            });
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%status, "Tracer exited");
                self.exit_status = Some(status);
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not poll tracer");
                false
            }
        }
    }

    fn logs(&self) -> Result<TraceLogs, TraceError> {
        TraceLogs::read(&self.log_path)
    }
}
