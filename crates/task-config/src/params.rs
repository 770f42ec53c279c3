//! Task parameters returned by the controller in response to the `started` report.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::files::RemoteFileDescriptor;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub input_files: Vec<RemoteFileDescriptor>,
    /// `null` entries are allowed in positional mode and mean "do not upload".
    #[serde(default)]
    pub result_files: Vec<Option<RemoteFileDescriptor>>,
    /// Either a mapping or a list; validated when the command is assembled.
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub sandbox: Option<Value>,
    #[serde(default)]
    pub tracing: Option<Value>,
    /// Data containers only: tokens chosen by the controller.
    #[serde(default)]
    pub input_file_keys: Option<Vec<String>>,
    #[serde(default)]
    pub num_workers: Option<u32>,
}
