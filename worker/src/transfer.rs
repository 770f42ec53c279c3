//! Drives the connector registries over paired local and remote files.

use connectors::{ConnectorError, Direction, DownloaderRegistry, Metadata, UploaderRegistry};
use serde_json::Value;
use task_config::{LocalFileRef, LocalResultFiles, RemoteFileDescriptor};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{local} local {what} declared but {remote} descriptors received")]
    CountMismatch {
        what: &'static str,
        local: usize,
        remote: usize,
    },

    #[error("Result descriptor {index} has no local_result_file key")]
    MissingResultKey { index: usize },

    #[error("No local result file named \"{key}\"")]
    UnknownResultKey { key: String },

    #[error("Result file {path} does not exist and is not optional")]
    MissingResultFile { path: String },

    #[error("Failed to {direction} {path} via \"{connector}\"")]
    Connector {
        direction: Direction,
        connector: String,
        path: String,
        #[source]
        source: ConnectorError,
    },
}

/// A remote descriptor and the local file it maps to.
pub type FilePair<'a> = (&'a RemoteFileDescriptor, &'a LocalFileRef);

/// Identity stamped onto uploads that ask for it.
pub fn metadata(container_id: &str, task_id: Option<&str>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(
        "application_container_id".to_string(),
        Value::String(container_id.to_string()),
    );
    metadata.insert(
        "task_id".to_string(),
        task_id.map_or(Value::Null, |id| Value::String(id.to_string())),
    );
    metadata
}

/// Zip input descriptors with the declared local inputs. Counts must match.
pub fn pair_inputs<'a>(
    remote: &'a [RemoteFileDescriptor],
    local: &'a [LocalFileRef],
) -> Result<Vec<FilePair<'a>>, TransferError> {
    if remote.len() != local.len() {
        return Err(TransferError::CountMismatch {
            what: "input files",
            local: local.len(),
            remote: remote.len(),
        });
    }
    Ok(remote.iter().zip(local).collect())
}

/// Pair result descriptors with declared result files.
///
/// Positional lists are zipped and must have equal length; `null`
/// descriptors are dropped. Keyed maps are addressed by each descriptor's
/// `local_result_file`, in descriptor order.
pub fn pair_results<'a>(
    remote: &'a [Option<RemoteFileDescriptor>],
    local: &'a LocalResultFiles,
) -> Result<Vec<FilePair<'a>>, TransferError> {
    match local {
        LocalResultFiles::List(files) => {
            if remote.len() != files.len() {
                return Err(TransferError::CountMismatch {
                    what: "result files",
                    local: files.len(),
                    remote: remote.len(),
                });
            }
            Ok(remote
                .iter()
                .zip(files)
                .filter_map(|(descriptor, file)| descriptor.as_ref().map(|d| (d, file)))
                .collect())
        }
        LocalResultFiles::Keyed(_) => remote
            .iter()
            .enumerate()
            .filter_map(|(index, descriptor)| descriptor.as_ref().map(|d| (index, d)))
            .map(|(index, descriptor)| -> Result<FilePair<'a>, TransferError> {
                let key = descriptor
                    .local_result_file
                    .as_deref()
                    .ok_or(TransferError::MissingResultKey { index })?;
                let file = local
                    .get(key)
                    .ok_or_else(|| TransferError::UnknownResultKey { key: key.to_string() })?;
                Ok((descriptor, file))
            })
            .collect(),
    }
}

/// Download every pair in order. The first failure aborts the batch.
#[instrument(skip_all, fields(files = pairs.len()))]
pub async fn download_all(registry: &DownloaderRegistry, pairs: &[FilePair<'_>]) -> Result<(), TransferError> {
    for (remote, local) in pairs {
        let connector_error = |source| TransferError::Connector {
            direction: Direction::Download,
            connector: remote.connector_type.clone(),
            path: local.path().display().to_string(),
            source,
        };
        let downloader = registry.resolve(&remote.connector_type).map_err(connector_error)?;
        downloader
            .download(&remote.connector_access, local)
            .await
            .map_err(connector_error)?;
        debug!(path = %local.path().display(), connector = %remote.connector_type, "Downloaded");
    }
    info!("Input files retrieved");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Sent,
    /// Optional file that was not produced.
    Skipped,
}

/// Upload one file. Absent optional files are skipped; absent required
/// files fail. Metadata is passed only if the descriptor asks for it.
pub async fn upload_one(
    registry: &UploaderRegistry,
    remote: &RemoteFileDescriptor,
    local: &LocalFileRef,
    metadata: &Metadata,
) -> Result<UploadOutcome, TransferError> {
    if !local.exists() {
        if local.optional {
            debug!(path = %local.path().display(), "Optional file absent, not uploading");
            return Ok(UploadOutcome::Skipped);
        }
        return Err(TransferError::MissingResultFile {
            path: local.path().display().to_string(),
        });
    }

    let connector_error = |source| TransferError::Connector {
        direction: Direction::Upload,
        connector: remote.connector_type.clone(),
        path: local.path().display().to_string(),
        source,
    };
    let uploader = registry.resolve(&remote.connector_type).map_err(connector_error)?;
    let metadata = remote.add_meta_data.then_some(metadata);
    uploader
        .upload(&remote.connector_access, local, metadata)
        .await
        .map_err(connector_error)?;

    debug!(path = %local.path().display(), connector = %remote.connector_type, "Uploaded");
    Ok(UploadOutcome::Sent)
}

/// Upload every pair in order, stopping at the first failure.
#[instrument(skip_all, fields(files = pairs.len()))]
pub async fn upload_all(
    registry: &UploaderRegistry,
    pairs: &[FilePair<'_>],
    metadata: &Metadata,
) -> Result<Vec<UploadOutcome>, TransferError> {
    let mut outcomes = Vec::with_capacity(pairs.len());
    for (remote, local) in pairs {
        outcomes.push(upload_one(registry, remote, local, metadata).await?);
    }
    Ok(outcomes)
}
