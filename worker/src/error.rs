//! Failures of a worker run and how each one is reported.

use serde_json::Value;
use std::error::Error as StdError;
use task_config::ConfigError;
use thiserror::Error;

use crate::callback::{CallbackError, Phase, Report};
use crate::execution::ExecutionError;
use crate::transfer::TransferError;

pub mod exit {
    pub const SUCCESS: i32 = 0;
    /// Nothing could be reported to the controller.
    pub const UNREPORTABLE: i32 = 1;
    pub const KEY_COUNT_MISMATCH: i32 = 2;
    pub const STATIC_CONFIG: i32 = 3;
    pub const STAGING: i32 = 3;
    pub const PEER_SERVER: i32 = 4;
    pub const COUNT_MISMATCH: i32 = 5;
    pub const DOWNLOAD: i32 = 6;
    pub const EXECUTION: i32 = 8;
    pub const NON_ZERO_EXIT: i32 = 9;
    pub const UPLOAD: i32 = 10;
    pub const UNKNOWN_CONTAINER_TYPE: i32 = 42;
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Could not load JSON config file from path {path}")]
    StaticConfig {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Number of local_input_files in config does not match input_files.")]
    InputCountMismatch {
        #[source]
        source: TransferError,
    },

    #[error("Result files in task parameters do not match local_result_files in config.")]
    ResultMapping {
        #[source]
        source: TransferError,
    },

    #[error("Could not retrieve input files.")]
    Download {
        #[source]
        source: TransferError,
    },

    #[error("Processing failed.")]
    Execution {
        #[source]
        source: ExecutionError,
    },

    #[error("Processing failed: application exited with return code {code}.")]
    NonZeroExit { code: i32, telemetry: Box<Value> },

    #[error("Processing failed and tracing file upload failed.")]
    NonZeroExitTraceUpload {
        code: i32,
        telemetry: Box<Value>,
        #[source]
        source: TransferError,
    },

    #[error("Tracing file upload failed.")]
    TraceUpload {
        telemetry: Box<Value>,
        #[source]
        source: TransferError,
    },

    #[error("Could not send result files.")]
    Upload {
        #[source]
        source: TransferError,
    },

    #[error("Number of input_file_keys does not match number of input_files.")]
    KeyCountMismatch { keys: usize, files: usize },

    #[error("Could not retrieve input files.")]
    Staging {
        #[source]
        source: TransferError,
    },

    #[error("Could not start peer file server on {addr}.")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer file server stopped: {source}")]
    PeerServer {
        #[source]
        source: std::io::Error,
    },

    #[error("Inspection request failed: {message}")]
    Inspection { message: String },

    #[error("Could not set up connectors: {message}")]
    Connectors { message: String },

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("Unknown container type \"{container_type}\"")]
    UnknownContainerType { container_type: String },
}

impl WorkerError {
    /// Phase to report as failed. `None` when there is nobody to report to or
    /// the failure happens outside the phase protocol.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            WorkerError::StaticConfig { .. } => Some(Phase::Started),
            WorkerError::InputCountMismatch { .. }
            | WorkerError::ResultMapping { .. }
            | WorkerError::Download { .. }
            | WorkerError::KeyCountMismatch { .. }
            | WorkerError::Staging { .. }
            | WorkerError::Bind { .. } => Some(Phase::FilesRetrieved),
            WorkerError::Execution { .. }
            | WorkerError::NonZeroExit { .. }
            | WorkerError::NonZeroExitTraceUpload { .. }
            | WorkerError::TraceUpload { .. } => Some(Phase::Processed),
            WorkerError::Upload { .. } => Some(Phase::ResultsSent),
            WorkerError::PeerServer { .. }
            | WorkerError::Inspection { .. }
            | WorkerError::Connectors { .. }
            | WorkerError::Callback(_)
            | WorkerError::UnknownContainerType { .. } => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::StaticConfig { .. } => exit::STATIC_CONFIG,
            WorkerError::InputCountMismatch { .. } | WorkerError::ResultMapping { .. } => {
                exit::COUNT_MISMATCH
            }
            WorkerError::Download { .. } => exit::DOWNLOAD,
            WorkerError::Execution { .. } => exit::EXECUTION,
            WorkerError::NonZeroExit { .. } | WorkerError::NonZeroExitTraceUpload { .. } => {
                exit::NON_ZERO_EXIT
            }
            WorkerError::TraceUpload { .. } | WorkerError::Upload { .. } => exit::UPLOAD,
            WorkerError::KeyCountMismatch { .. } => exit::KEY_COUNT_MISMATCH,
            WorkerError::Staging { .. } => exit::STAGING,
            WorkerError::Bind { .. } | WorkerError::PeerServer { .. } => exit::PEER_SERVER,
            WorkerError::Inspection { .. }
            | WorkerError::Connectors { .. }
            | WorkerError::Callback(_) => exit::UNREPORTABLE,
            WorkerError::UnknownContainerType { .. } => exit::UNKNOWN_CONTAINER_TYPE,
        }
    }

    /// Rendered chain of underlying causes.
    pub fn exception(&self) -> Option<String> {
        let mut causes = Vec::new();
        let mut current = self.source();
        while let Some(cause) = current {
            causes.push(cause.to_string());
            current = cause.source();
        }
        (!causes.is_empty()).then(|| causes.join("\nCaused by: "))
    }

    pub fn telemetry(&self) -> Option<Value> {
        match self {
            WorkerError::NonZeroExit { telemetry, .. }
            | WorkerError::NonZeroExitTraceUpload { telemetry, .. }
            | WorkerError::TraceUpload { telemetry, .. } => Some(telemetry.as_ref().clone()),
            _ => None,
        }
    }

    /// The `failed` report for this error, if it belongs to a phase.
    pub fn report(&self) -> Option<Report> {
        let phase = self.phase()?;
        let mut report = Report::failed(phase, self.to_string()).with_exception(self.exception());
        if let Some(telemetry) = self.telemetry() {
            report = report.with_telemetry(telemetry);
        }
        Some(report)
    }
}
