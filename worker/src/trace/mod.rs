//! Workload tracing.
//!
//! A tracer records raw events for the workload's process tree; the
//! aggregator turns them into result sections whose detail follows the
//! tier configured per axis. Sections for axes set to `none` are left out.

pub mod tracer;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use task_config::RemoteFileDescriptor;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::monitor::ProcFs;

pub use tracer::{CommandTracer, LogEvent, SyscallArgument, TraceLogs, Tracer};

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Invalid tracing config: {message}")]
    InvalidConfig { message: String },

    #[error("Tracing requested but no tracer program is configured")]
    NoTracerProgram,

    #[error("Failed to run tracer {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("Tracer exited with {status}")]
    TracerExited { status: String },

    #[error("Tracer exited while process {pid} was still stopped")]
    LeftStopped { pid: u32 },

    #[error("Tracer log {path}: {message}")]
    Log { path: String, message: String },

    #[error("Tracer log line {line} is invalid: {message}")]
    InvalidLog { line: usize, message: String },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Tracer task failed: {message}")]
    Join { message: String },
}

/// Detail level of one tracing axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    None,
    Short,
    Full,
}

impl Tier {
    pub fn flag_value(self) -> Option<&'static str> {
        match self {
            Tier::None => None,
            Tier::Short => Some("short"),
            Tier::Full => Some("full"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Process lifecycle axis.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub file_access: Tier,
    #[serde(default)]
    pub syscall: Tier,
    /// Where to upload the tracer log after the run.
    #[serde(default)]
    pub tracing_file: Option<RemoteFileDescriptor>,
}

impl TracingConfig {
    /// `None` when the task carries no tracing section.
    pub fn from_value(value: Option<&Value>) -> Result<Option<Self>, TraceError> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|e| TraceError::InvalidConfig {
                    message: e.to_string(),
                }),
        }
    }

    /// At least one axis records something.
    pub fn is_active(&self) -> bool {
        self.enabled || self.file_access != Tier::None || self.syscall != Tier::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAccessRecord {
    pub pid: u32,
    pub filename: String,
    pub is_directory: bool,
    pub exists: bool,
    pub syscall: String,
    pub access_time: f64,
    pub syscall_result: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FileAccessSection {
    Names(BTreeSet<String>),
    Events(Vec<FileAccessRecord>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyscallRecord {
    pub pid: u32,
    pub name: String,
    pub start: f64,
    pub end: Option<f64>,
    pub result: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<SyscallArgument>>,
}

/// Aggregated trace attached to `processed` telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<ProcessRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_access: Option<FileAccessSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscalls: Option<Vec<SyscallRecord>>,
}

/// Shape `logs` into the sections enabled in `config`.
pub fn aggregate(config: &TracingConfig, logs: &TraceLogs) -> TraceResult {
    let mut result = TraceResult::default();

    if config.enabled {
        let mut order: Vec<u32> = Vec::new();
        let mut records: HashMap<u32, ProcessRecord> = HashMap::new();
        for event in &logs.events {
            let (pid, start, end) = match event {
                LogEvent::ProcessStart { pid, time } => (*pid, Some(*time), None),
                LogEvent::ProcessEnd { pid, time, .. } => (*pid, None, Some(*time)),
                _ => continue,
            };
            let record = records.entry(pid).or_insert_with(|| {
                order.push(pid);
                ProcessRecord {
                    pid,
                    start: None,
                    end: None,
                    exit_code: None,
                    signal: None,
                }
            });
            if start.is_some() {
                record.start = start;
            }
            if let LogEvent::ProcessEnd { exit_code, signal, .. } = event {
                record.end = end;
                record.exit_code = *exit_code;
                record.signal = *signal;
            }
        }
        result.processes = Some(order.iter().filter_map(|pid| records.remove(pid)).collect());
    }

    let accesses = logs.events.iter().filter_map(|event| match event {
        LogEvent::FileAccess {
            pid,
            time,
            filename,
            is_directory,
            exists,
            syscall,
            result,
        } => Some(FileAccessRecord {
            pid: *pid,
            filename: filename.clone(),
            is_directory: *is_directory,
            exists: *exists,
            syscall: syscall.clone(),
            access_time: *time,
            syscall_result: *result,
        }),
        _ => None,
    });
    result.file_access = match config.file_access {
        Tier::None => None,
        Tier::Short => Some(FileAccessSection::Names(
            accesses.map(|record| record.filename).collect(),
        )),
        Tier::Full => Some(FileAccessSection::Events(accesses.collect())),
    };

    if config.syscall != Tier::None {
        let full = config.syscall == Tier::Full;
        let syscalls = logs
            .events
            .iter()
            .filter_map(|event| match event {
                LogEvent::Syscall {
                    pid,
                    name,
                    start,
                    end,
                    result,
                    arguments,
                } => Some(SyscallRecord {
                    pid: *pid,
                    name: name.clone(),
                    start: *start,
                    end: *end,
                    result: *result,
                    attributes: full.then(|| arguments.clone()),
                }),
                _ => None,
            })
            .collect();
        result.syscalls = Some(syscalls);
    }

    result
}

/// Continue a process stopped right after spawn.
pub fn resume(pid: u32) -> Result<(), TraceError> {
    let raw = i32::try_from(pid).map_err(|e| TraceError::Signal {
        pid,
        message: e.to_string(),
    })?;
    kill(Pid::from_raw(raw), Signal::SIGCONT).map_err(|e| TraceError::Signal {
        pid,
        message: e.to_string(),
    })
}

/// Fails when nothing resumed `pid` after it was stopped for attach.
pub fn ensure_resumed(pid: u32) -> Result<(), TraceError> {
    if ProcFs::new().is_stopped(pid) {
        return Err(TraceError::LeftStopped { pid });
    }
    Ok(())
}

/// Kill a workload whose tracer gave up on it, stopped or not.
pub fn halt(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    for signal in [Signal::SIGKILL, Signal::SIGCONT] {
        if let Err(e) = kill(Pid::from_raw(raw), signal) {
            warn!(pid, ?signal, error = %e, "Could not signal workload");
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> TraceError {
    TraceError::Join {
        message: err.to_string(),
    }
}

/// A tracer whose blocking `wait` has returned.
struct Exited {
    tracer: Box<dyn Tracer>,
    status: Result<(), TraceError>,
}

enum Attachment {
    Detached,
    Waiting(JoinHandle<Exited>),
    Exited(Exited),
}

/// Owns the tracer for one workload run.
pub struct TraceAggregator {
    config: TracingConfig,
    attachment: Attachment,
}

impl std::fmt::Debug for TraceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceAggregator")
            .field("config", &self.config)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl TraceAggregator {
    /// Attach `tracer` to the stopped workload `pid` and start waiting for it
    /// on the blocking pool. With every axis off the tracer is never started
    /// and the workload is resumed directly.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: TracingConfig, pid: u32, mut tracer: Box<dyn Tracer>) -> Result<Self, TraceError> {
        if !config.is_active() {
            debug!(pid, "All tracing axes off, resuming workload");
            resume(pid)?;
            return Ok(Self {
                config,
                attachment: Attachment::Detached,
            });
        }

        tracer.start()?;
        let waiting = tokio::task::spawn_blocking(move || {
            let status = tracer.wait();
            Exited { tracer, status }
        });
        Ok(Self {
            config,
            attachment: Attachment::Waiting(waiting),
        })
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.attachment, Attachment::Detached)
    }

    /// Resolve when the tracer exits, with its exit result. The result is
    /// handed out once; later calls see `Ok`. Pending forever when no tracer
    /// was started. Cancel safe.
    pub async fn tracer_exit(&mut self) -> Result<(), TraceError> {
        let waiting = match &mut self.attachment {
            Attachment::Detached => return std::future::pending().await,
            Attachment::Exited(exited) => return std::mem::replace(&mut exited.status, Ok(())),
            Attachment::Waiting(waiting) => waiting,
        };
        let joined = waiting.await;
        match joined {
            Ok(mut exited) => {
                let status = std::mem::replace(&mut exited.status, Ok(()));
                self.attachment = Attachment::Exited(exited);
                status
            }
            Err(e) => {
                self.attachment = Attachment::Detached;
                Err(join_error(e))
            }
        }
    }

    /// Wait for the tracer to finish and aggregate its log. `None` when no
    /// tracer was started.
    pub async fn result(mut self) -> Result<Option<TraceResult>, TraceError> {
        if matches!(self.attachment, Attachment::Waiting(_)) {
            self.tracer_exit().await?;
        }
        let Attachment::Exited(exited) = self.attachment else {
            return Ok(None);
        };
        exited.status?;
        let tracer = exited.tracer;
        let config = self.config;

        tokio::task::spawn_blocking(move || {
            let logs = tracer.logs()?;
            info!(events = logs.events.len(), "Trace log collected");
            Ok(Some(aggregate(&config, &logs)))
        })
        .await
        .map_err(join_error)?
    }
}
