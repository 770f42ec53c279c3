//! Peer File Server
//!
//! Serves files staged by a data container to other containers. Each file is
//! registered under a capability token; a lookup must present the file's
//! descriptor fields and the matching token.

pub mod routes;
pub mod tokens;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use task_config::LocalFileRef;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use routes::LookupRequest;
pub use tokens::CapabilityToken;

/// A staged file and the descriptor it was fetched with.
#[derive(Debug, Clone)]
pub struct RegisteredFile {
    pub token: CapabilityToken,
    pub local: LocalFileRef,
    pub connector_type: String,
    pub connector_access: Value,
}

impl RegisteredFile {
    /// Descriptor fields must be equal and the token must match. The token
    /// comparison runs even when the descriptor differs.
    pub fn matches(&self, request: &LookupRequest) -> bool {
        let token_ok = self.token.matches(&request.input_file_key);
        let descriptor_ok = self.connector_type == request.connector_type
            && self.connector_access == request.connector_access;
        token_ok & descriptor_ok
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub files: Arc<Vec<RegisteredFile>>,
}

impl AppState {
    pub fn new(files: Vec<RegisteredFile>) -> Self {
        info!(files = files.len(), "Peer file server state initialized");
        Self {
            files: Arc::new(files),
        }
    }

    pub fn find(&self, request: &LookupRequest) -> Option<&RegisteredFile> {
        self.files.iter().find(|file| file.matches(request))
    }
}

/// Lookup failure. The client only ever sees the status code.
#[derive(Debug)]
pub struct AppError {
    pub status_code: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn not_found() -> Self {
        AppError {
            status_code: StatusCode::NOT_FOUND,
            message: "No staged file matches the request".to_string(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!(status = %self.status_code, "{}", self.message);
        self.status_code.into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Create the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::lookup_file).post(routes::lookup_file))
        // Request bodies carry tokens; the trace layer only logs method and path.
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `state` on `listener` until the process is terminated.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("Peer file server listening on {}", addr);
    axum::serve(listener, create_app(state)).await
}
