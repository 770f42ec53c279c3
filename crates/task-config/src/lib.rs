use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod files;
pub mod launch;
pub mod params;

pub use files::{LocalFileRef, LocalResultFiles, RemoteFileDescriptor};
pub use launch::LaunchSettings;
pub use params::TaskParameters;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed: {}", format_validation_errors(.errors))]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} at '{}'", e.message, e.json_pointer))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Task shape baked into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticTaskConfig {
    pub application_command: String,
    pub local_input_files: Vec<LocalFileRef>,
    pub local_result_files: LocalResultFiles,
}

impl StaticTaskConfig {
    /// Read and validate the static config at `path`.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading static task config from: {:?}", path);

        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file: {}", e),
        })?;

        let value: Value =
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
                message: e.to_string(),
            })?;

        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        validate_static_config(&value)?;

        serde_json::from_value(value).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })
    }
}

/// Location of the static config inside the image.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".config")
        .join("cc-container-worker")
        .join("config.json")
}

fn static_config_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "definitions": {
            "local_file": {
                "type": "object",
                "properties": {
                    "dir": { "type": "string" },
                    "name": { "type": "string" },
                    "optional": { "type": "boolean" }
                },
                "required": ["dir", "name"],
                "additionalProperties": false
            }
        },
        "properties": {
            "application_command": { "type": "string" },
            "local_input_files": {
                "type": "array",
                "items": { "$ref": "#/definitions/local_file" }
            },
            "local_result_files": {
                "oneOf": [
                    {
                        "type": "array",
                        "items": { "$ref": "#/definitions/local_file" }
                    },
                    {
                        "type": "object",
                        "patternProperties": {
                            "^[a-zA-Z0-9_-]+$": { "$ref": "#/definitions/local_file" }
                        },
                        "additionalProperties": false
                    }
                ]
            }
        },
        "required": ["application_command", "local_input_files", "local_result_files"],
        "additionalProperties": false
    })
}

fn validate_static_config(config: &Value) -> Result<(), ConfigError> {
    let schema_value = static_config_schema();
    let schema = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_value)
        .map_err(|e| ConfigError::SchemaCompilationFailed {
            message: e.to_string(),
        })?;

    if let Err(errors) = schema.validate(config) {
        let validation_errors: Vec<ValidationError> = errors
            .map(|error| ValidationError {
                json_pointer: error.instance_path.to_string(),
                message: error.to_string(),
                schema_path: error.schema_path.to_string(),
            })
            .collect();

        return Err(ConfigError::ValidationFailed {
            errors: validation_errors,
        });
    }

    Ok(())
}
