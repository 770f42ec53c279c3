//! Phase reports sent to the controller.
//!
//! Every report is a fresh [`CallbackEnvelope`] POSTed to the callback URL.
//! Only the response to the `started` report carries a body the worker reads:
//! the task parameters for this run.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use task_config::{LaunchSettings, TaskParameters};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Lifecycle phase, serialized as its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    FilesRetrieved,
    Processed,
    ResultsSent,
}

impl Phase {
    /// Phases of an application container, in order.
    pub const APPLICATION: [Phase; 4] = [
        Phase::Started,
        Phase::FilesRetrieved,
        Phase::Processed,
        Phase::ResultsSent,
    ];

    /// Phases of a data container, in order.
    pub const DATA: [Phase; 2] = [Phase::Started, Phase::FilesRetrieved];

    pub fn index(self) -> u8 {
        match self {
            Phase::Started => 0,
            Phase::FilesRetrieved => 1,
            Phase::Processed => 2,
            Phase::ResultsSent => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::FilesRetrieved => "files_retrieved",
            Phase::Processed => "processed",
            Phase::ResultsSent => "results_sent",
        }
    }
}

/// Report state, serialized as its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Waiting,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl State {
    pub fn index(self) -> u8 {
        match self {
            State::Created => 0,
            State::Waiting => 1,
            State::Processing => 2,
            State::Success => 3,
            State::Failed => 4,
            State::Cancelled => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackContent {
    pub state: u8,
    pub description: String,
    pub exception: Option<String>,
    pub telemetry: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackEnvelope {
    pub callback_key: String,
    pub callback_type: u8,
    pub container_id: String,
    pub content: CallbackContent,
}

/// One phase outcome, before the identity fields are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub phase: Phase,
    pub state: State,
    pub description: String,
    pub exception: Option<String>,
    pub telemetry: Option<Value>,
}

impl Report {
    pub fn success(phase: Phase, description: impl Into<String>) -> Self {
        Self {
            phase,
            state: State::Success,
            description: description.into(),
            exception: None,
            telemetry: None,
        }
    }

    pub fn failed(phase: Phase, description: impl Into<String>) -> Self {
        Self {
            state: State::Failed,
            ..Self::success(phase, description)
        }
    }

    pub fn with_exception(mut self, exception: Option<String>) -> Self {
        self.exception = exception;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Value) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Callback to {url} could not be delivered: {message}")]
    Delivery { url: String, message: String },

    #[error("Callback to {url} was rejected with status {status}")]
    Rejected { url: String, status: u16 },

    #[error("Task parameters in started response are invalid: {message}")]
    InvalidParameters { message: String },
}

/// Sends reports for one container.
#[derive(Debug, Clone)]
pub struct CallbackHandler {
    client: reqwest::Client,
    url: String,
    callback_key: String,
    container_id: String,
}

impl CallbackHandler {
    pub fn new(settings: &LaunchSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: settings.callback_url.clone(),
            callback_key: settings.callback_key.clone(),
            container_id: settings.container_id.clone(),
        }
    }

    pub fn envelope(&self, report: &Report) -> CallbackEnvelope {
        CallbackEnvelope {
            callback_key: self.callback_key.clone(),
            callback_type: report.phase.index(),
            container_id: self.container_id.clone(),
            content: CallbackContent {
                state: report.state.index(),
                description: report.description.clone(),
                exception: report.exception.clone(),
                telemetry: report.telemetry.clone(),
            },
        }
    }

    /// POST `report` and return the raw response body.
    #[instrument(skip(self, report), fields(phase = report.phase.name(), state = report.state.index()))]
    pub async fn send(&self, report: &Report) -> Result<Vec<u8>, CallbackError> {
        let envelope = self.envelope(report);
        let body = serde_json::to_vec(&envelope).map_err(|e| CallbackError::Delivery {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| CallbackError::Delivery {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Controller rejected callback");
            return Err(CallbackError::Rejected {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CallbackError::Delivery {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        info!(description = %report.description, "Callback delivered");
        Ok(bytes.to_vec())
    }

    /// Send the successful `started` report and parse the task parameters
    /// from the response.
    pub async fn started(&self) -> Result<TaskParameters, CallbackError> {
        let body = self
            .send(&Report::success(Phase::Started, "Container started."))
            .await?;
        let params: TaskParameters =
            serde_json::from_slice(&body).map_err(|e| CallbackError::InvalidParameters {
                message: e.to_string(),
            })?;
        debug!(
            task_id = ?params.task_id,
            input_files = params.input_files.len(),
            result_files = params.result_files.len(),
            "Task parameters received"
        );
        Ok(params)
    }
}
