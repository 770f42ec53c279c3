//! Inspection containers: one GET against the controller, then exit.

use anyhow::{bail, Context};
use task_config::LaunchSettings;
use tracing::info;

use crate::error::WorkerError;

pub async fn run(settings: &LaunchSettings) -> Result<(), WorkerError> {
    inspect(settings)
        .await
        .map_err(|e| WorkerError::Inspection {
            message: format!("{:#}", e),
        })
}

async fn inspect(settings: &LaunchSettings) -> anyhow::Result<()> {
    let url = settings
        .inspection_url
        .as_deref()
        .context("launch settings carry no inspection_url")?;

    let response = reqwest::get(url)
        .await
        .with_context(|| format!("GET {} failed", url))?;
    let status = response.status();
    if !status.is_success() {
        bail!("GET {} returned status {}", url, status.as_u16());
    }

    info!(url, status = status.as_u16(), "Inspection succeeded");
    Ok(())
}
