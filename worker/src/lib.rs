//! Container Worker
//!
//! Runs inside a disposable compute container. An application container
//! fetches its inputs, runs one workload under optional confinement while
//! sampling memory and tracing it, then uploads the results, reporting each
//! phase to the controller. A data container stages files and serves them to
//! peers; an inspection container only checks in with the controller.

pub mod application;
pub mod callback;
pub mod config;
pub mod data;
pub mod error;
pub mod execution;
pub mod inspection;
pub mod monitor;
pub mod network;
pub mod trace;
pub mod transfer;

use connectors::{ConnectorRegistry, Direction, DownloaderRegistry, UploaderRegistry};
use std::sync::Arc;
use task_config::LaunchSettings;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub use callback::{CallbackHandler, Phase, Report, State};
pub use config::WorkerOptions;
pub use error::{exit, WorkerError};

/// Everything a container variant needs for one run.
pub struct WorkerContext {
    pub settings: LaunchSettings,
    pub options: WorkerOptions,
    pub callback: CallbackHandler,
    pub downloaders: Arc<DownloaderRegistry>,
    pub uploaders: Arc<UploaderRegistry>,
}

impl WorkerContext {
    /// Merge the first-party connectors with `downloads` and `uploads`;
    /// entries in the overrides win.
    pub fn new(
        settings: LaunchSettings,
        options: WorkerOptions,
        downloads: DownloaderRegistry,
        uploads: UploaderRegistry,
    ) -> Result<Self, WorkerError> {
        let (first_downloads, first_uploads) =
            connectors::first_party().map_err(|e| WorkerError::Connectors {
                message: e.to_string(),
            })?;
        let callback = CallbackHandler::new(&settings);
        Ok(Self {
            settings,
            options,
            callback,
            downloaders: Arc::new(ConnectorRegistry::merge(first_downloads, downloads)),
            uploaders: Arc::new(ConnectorRegistry::merge(first_uploads, uploads)),
        })
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the defaults.
pub fn init_logging(json: bool, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run with first-party connectors only and return the process exit code.
pub async fn run(options: WorkerOptions) -> i32 {
    run_with_connectors(
        options,
        DownloaderRegistry::new(Direction::Download),
        UploaderRegistry::new(Direction::Upload),
    )
    .await
}

/// Run with extra connectors merged over the first-party ones and return
/// the process exit code.
pub async fn run_with_connectors(
    options: WorkerOptions,
    downloads: DownloaderRegistry,
    uploads: UploaderRegistry,
) -> i32 {
    let settings = match LaunchSettings::from_json(&options.settings) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Launch settings are unusable");
            return exit::UNREPORTABLE;
        }
    };
    info!(
        container_id = %settings.container_id,
        container_type = %settings.container_type,
        "Container worker starting"
    );

    network::apply_mtu(&settings.mtu).await;

    let container_type = settings.container_type.clone();
    match container_type.as_str() {
        variant @ ("application" | "data") => {
            let ctx = match WorkerContext::new(settings, options, downloads, uploads) {
                Ok(ctx) => ctx,
                Err(e) => return conclude(None, Err(e)).await,
            };
            let result = if variant == "application" {
                application::run(&ctx).await
            } else {
                data::run(&ctx).await
            };
            conclude(Some(&ctx.callback), result).await
        }
        "inspection" => conclude(None, inspection::run(&settings).await).await,
        other => {
            let err = WorkerError::UnknownContainerType {
                container_type: other.to_string(),
            };
            conclude(None, Err(err)).await
        }
    }
}

/// Send the failed report, if any, and map the outcome to an exit code.
async fn conclude(callback: Option<&CallbackHandler>, result: Result<(), WorkerError>) -> i32 {
    let err = match result {
        Ok(()) => {
            info!("Container worker finished");
            return exit::SUCCESS;
        }
        Err(err) => err,
    };

    error!(
        error = %err,
        exception = err.exception().as_deref().unwrap_or(""),
        exit_code = err.exit_code(),
        "Container worker failed"
    );

    if let (Some(callback), Some(report)) = (callback, err.report()) {
        if let Err(e) = callback.send(&report).await {
            error!(error = %e, "Failure report could not be delivered");
            return exit::UNREPORTABLE;
        }
    }
    err.exit_code()
}
