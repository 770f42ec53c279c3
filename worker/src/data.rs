//! Data containers: stage input files and serve them to peers.

use peer_server::{AppState, CapabilityToken, RegisteredFile};
use serde_json::json;
use task_config::LocalFileRef;
use tokio::net::TcpListener;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::callback::{Phase, Report};
use crate::error::WorkerError;
use crate::transfer::{self, FilePair};
use crate::WorkerContext;

#[instrument(skip_all, fields(container_id = %ctx.settings.container_id))]
pub async fn run(ctx: &WorkerContext) -> Result<(), WorkerError> {
    let params = ctx.callback.started().await?;
    if let Some(workers) = params.num_workers {
        debug!(num_workers = workers, "Controller suggested download parallelism");
    }

    let tokens: Vec<CapabilityToken> = match &params.input_file_keys {
        Some(keys) if keys.len() != params.input_files.len() => {
            return Err(WorkerError::KeyCountMismatch {
                keys: keys.len(),
                files: params.input_files.len(),
            });
        }
        Some(keys) => keys
            .iter()
            .map(|key| CapabilityToken::from_key(key.as_str()))
            .collect(),
        None => params
            .input_files
            .iter()
            .map(|_| CapabilityToken::generate())
            .collect(),
    };

    let data_dir = ctx.options.data_dir();
    let staged: Vec<LocalFileRef> = params
        .input_files
        .iter()
        .map(|_| LocalFileRef::new(data_dir.to_string_lossy(), Uuid::new_v4().to_string()))
        .collect();
    let pairs: Vec<FilePair<'_>> = params.input_files.iter().zip(&staged).collect();
    transfer::download_all(&ctx.downloaders, &pairs)
        .await
        .map_err(|source| WorkerError::Staging { source })?;

    let listener = TcpListener::bind(&ctx.options.bind_addr)
        .await
        .map_err(|source| WorkerError::Bind {
            addr: ctx.options.bind_addr.clone(),
            source,
        })?;

    let keys: Vec<&str> = tokens.iter().map(CapabilityToken::as_str).collect();
    let report = Report::success(Phase::FilesRetrieved, "Input files available.")
        .with_telemetry(json!({ "input_file_keys": keys }));

    let files: Vec<RegisteredFile> = tokens
        .iter()
        .zip(params.input_files)
        .zip(staged)
        .map(|((token, remote), local)| RegisteredFile {
            token: token.clone(),
            local,
            connector_type: remote.connector_type,
            connector_access: remote.connector_access,
        })
        .collect();

    ctx.callback.send(&report).await?;
    info!(files = files.len(), "Input files staged");

    peer_server::serve(listener, AppState::new(files))
        .await
        .map_err(|source| WorkerError::PeerServer { source })
}
