//! File-transfer connectors.
//!
//! A connector moves one file between local disk and a remote location named
//! by a descriptor's `connector_type`. Downloads and uploads live in separate
//! registries; the worker merges the first-party tables built here with any
//! overrides before the first transfer and never mutates them afterwards.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use task_config::LocalFileRef;
use thiserror::Error;

pub mod auth;
pub mod http;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod registry;
#[cfg(feature = "ssh")]
pub mod ssh;

pub use registry::{ConnectorRegistry, DownloaderRegistry, UploaderRegistry};

/// Identity stamped onto uploaded records when a descriptor asks for it.
pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("No {direction} connector registered for \"{id}\"")]
    UnknownConnector { id: String, direction: Direction },

    #[error("Invalid connector_access for {connector}: {message}")]
    InvalidAccess { connector: String, message: String },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("File {path}: {message}")]
    Io { path: String, message: String },

    #[error("File {path} is not a JSON object: {message}")]
    InvalidJson { path: String, message: String },

    #[error("{connector} transport error: {message}")]
    Transport { connector: String, message: String },
}

impl ConnectorError {
    pub(crate) fn io(local: &LocalFileRef, err: impl fmt::Display) -> Self {
        ConnectorError::Io {
            path: local.path().display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Fetch a remote file to `local`, creating its directory first.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, access: &Value, local: &LocalFileRef) -> Result<(), ConnectorError>;
}

/// Send `local` to a remote location. `metadata` is only passed when the
/// descriptor sets `add_meta_data`.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        access: &Value,
        local: &LocalFileRef,
        metadata: Option<&Metadata>,
    ) -> Result<(), ConnectorError>;
}

pub(crate) fn parse_access<T: serde::de::DeserializeOwned>(
    connector: &str,
    access: &Value,
) -> Result<T, ConnectorError> {
    serde_json::from_value(access.clone()).map_err(|e| ConnectorError::InvalidAccess {
        connector: connector.to_string(),
        message: e.to_string(),
    })
}

/// Read `local` as a JSON object and merge `metadata` into it.
pub(crate) async fn read_json_document(
    local: &LocalFileRef,
    metadata: Option<&Metadata>,
) -> Result<Map<String, Value>, ConnectorError> {
    let raw = tokio::fs::read(local.path())
        .await
        .map_err(|e| ConnectorError::io(local, e))?;
    let invalid = |message: String| ConnectorError::InvalidJson {
        path: local.path().display().to_string(),
        message,
    };
    let value: Value = serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;
    let Value::Object(mut document) = value else {
        return Err(invalid("top-level value must be an object".to_string()));
    };

    if let Some(metadata) = metadata {
        for (key, val) in metadata {
            document.insert(key.clone(), val.clone());
        }
    }
    Ok(document)
}

/// Download and upload tables with every connector compiled into this build.
pub fn first_party() -> Result<(DownloaderRegistry, UploaderRegistry), ConnectorError> {
    let clients = http::HttpClients::new()?;

    let mut downloaders = DownloaderRegistry::new(Direction::Download);
    downloaders.register("http", Arc::new(http::HttpDownloader::new(clients.clone())));

    let mut uploaders = UploaderRegistry::new(Direction::Upload);
    uploaders.register("http", Arc::new(http::HttpUploader::new(clients.clone())));
    let json_uploader = Arc::new(http::HttpJsonUploader::new(clients));
    uploaders.register("http_json", json_uploader.clone());
    uploaders.register("json", json_uploader);

    #[cfg(feature = "ssh")]
    {
        downloaders.register("ssh", Arc::new(ssh::SshConnector));
        uploaders.register("ssh", Arc::new(ssh::SshConnector));
    }

    #[cfg(feature = "mongodb")]
    {
        uploaders.register("mongodb_json", Arc::new(mongo::MongoJsonUploader));
        uploaders.register("mongodb_gridfs", Arc::new(mongo::MongoGridFsUploader));
    }

    Ok((downloaders, uploaders))
}
