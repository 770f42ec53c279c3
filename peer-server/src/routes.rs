//! HTTP route handlers for the peer file server

use crate::{AppError, AppResult, AppState};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Body of a lookup: the descriptor the file was staged from plus its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub connector_type: String,
    #[serde(default)]
    pub connector_access: Value,
    pub input_file_key: String,
}

/// GET|POST / - Stream the file matching the request body
///
/// Unparseable bodies get 400, unknown files or wrong keys 404, both without
/// a body.
pub async fn lookup_file(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let request: LookupRequest = serde_json::from_slice(&body).map_err(|e| AppError {
        status_code: StatusCode::BAD_REQUEST,
        message: format!("Malformed lookup request: {}", e),
    })?;
    debug!(connector_type = %request.connector_type, "Handling file lookup");

    let file = state.find(&request).ok_or_else(AppError::not_found)?;
    let path = file.local.path();

    let handle = tokio::fs::File::open(&path).await.map_err(|e| AppError {
        status_code: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("Failed to open staged file {}: {}", path.display(), e),
    })?;

    info!(path = %path.display(), "Streaming staged file");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.local.name),
        )
        .body(Body::from_stream(ReaderStream::new(handle)))
        .map_err(|e| AppError {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("Failed to build response: {}", e),
        })
}
