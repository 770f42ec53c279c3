//! Application containers: the four-phase lifecycle around one workload.

use serde_json::Value;
use std::fs;
use task_config::{LocalFileRef, StaticTaskConfig, TaskParameters};
use tracing::{debug, info, instrument, warn};

use crate::callback::{Phase, Report};
use crate::error::WorkerError;
use crate::execution::{assemble_command, ExecutionError, RunningWorkload, Workload, WorkloadOutcome};
use crate::monitor::ResourceMonitor;
use crate::trace::{self, CommandTracer, TraceAggregator, TraceError, Tracer, TracingConfig};
use crate::transfer::{self, UploadOutcome};
use crate::WorkerContext;

#[instrument(skip_all, fields(container_id = %ctx.settings.container_id))]
pub async fn run(ctx: &WorkerContext) -> Result<(), WorkerError> {
    let config_path = ctx.options.config_path();
    let config =
        StaticTaskConfig::load(&config_path).map_err(|source| WorkerError::StaticConfig {
            path: config_path.display().to_string(),
            source,
        })?;
    create_result_dirs(&config);

    let params = ctx.callback.started().await?;
    let metadata = transfer::metadata(&ctx.settings.container_id, params.task_id.as_deref());

    let inputs = transfer::pair_inputs(&params.input_files, &config.local_input_files)
        .map_err(|source| WorkerError::InputCountMismatch { source })?;
    let results = transfer::pair_results(&params.result_files, &config.local_result_files)
        .map_err(|source| WorkerError::ResultMapping { source })?;
    transfer::download_all(&ctx.downloaders, &inputs)
        .await
        .map_err(|source| WorkerError::Download { source })?;
    ctx.callback
        .send(&Report::success(Phase::FilesRetrieved, "Input files retrieved."))
        .await?;

    let telemetry = process(ctx, &config, &params).await?;
    ctx.callback
        .send(&Report::success(Phase::Processed, "Processing succeeded.").with_telemetry(telemetry))
        .await?;

    let outcomes = transfer::upload_all(&ctx.uploaders, &results, &metadata)
        .await
        .map_err(|source| WorkerError::Upload { source })?;
    debug!(
        sent = outcomes.iter().filter(|o| **o == UploadOutcome::Sent).count(),
        skipped = outcomes.iter().filter(|o| **o == UploadOutcome::Skipped).count(),
        "Result upload finished"
    );
    ctx.callback
        .send(&Report::success(Phase::ResultsSent, "Result files sent."))
        .await?;

    Ok(())
}

/// Best effort: the workload may expect its output directories to exist.
fn create_result_dirs(config: &StaticTaskConfig) {
    for local in config.local_result_files.refs() {
        if let Err(e) = fs::create_dir_all(&local.dir) {
            warn!(dir = %local.dir, error = %e, "Could not create result directory");
        }
    }
}

/// Run the workload and build the `processed` telemetry. Trace upload
/// happens here, before the phase is reported.
async fn process(
    ctx: &WorkerContext,
    config: &StaticTaskConfig,
    params: &TaskParameters,
) -> Result<Value, WorkerError> {
    let execution = |source: ExecutionError| WorkerError::Execution { source };

    let command = assemble_command(&config.application_command, params.parameters.as_ref())
        .map_err(execution)?;
    let activation = sandbox::build_from_value(params.sandbox.as_ref())
        .map_err(|e| execution(e.into()))?;
    let tracing_config =
        TracingConfig::from_value(params.tracing.as_ref()).map_err(|e| execution(e.into()))?;
    let tracer_program = match &tracing_config {
        Some(tc) if tc.is_active() => Some(
            ctx.options
                .tracer_bin
                .clone()
                .ok_or_else(|| execution(TraceError::NoTracerProgram.into()))?,
        ),
        _ => None,
    };

    let running = Workload::new(command, activation)
        .stop_on_spawn(tracing_config.is_some())
        .spawn()
        .map_err(execution)?;
    let pid = running.pid();
    let monitor = ResourceMonitor::start(pid);

    let mut aggregator = match tracing_config.clone() {
        Some(tc) => {
            let tracer: Box<dyn Tracer> = Box::new(CommandTracer::new(
                tracer_program.unwrap_or_default(),
                pid,
                ctx.options.tracing_file(),
                &tc,
            ));
            match TraceAggregator::start(tc, pid, tracer) {
                Ok(aggregator) => Some(aggregator),
                Err(e) => {
                    running.abort().await;
                    return Err(execution(e.into()));
                }
            }
        }
        None => None,
    };

    let outcome = match aggregator.as_mut().filter(|a| a.is_attached()) {
        Some(attached) => wait_traced(running, attached).await,
        None => running.wait().await,
    }
    .map_err(execution)?;
    let mut telemetry = monitor.finish(config);
    if let Some(aggregator) = aggregator {
        telemetry.tracing = aggregator.result().await.map_err(|e| execution(e.into()))?;
    }
    telemetry.return_code = Some(outcome.return_code);
    telemetry.std_out = Some(outcome.std_out).filter(|s| !s.is_empty());
    telemetry.std_err = Some(outcome.std_err).filter(|s| !s.is_empty());

    let telemetry = serde_json::to_value(&telemetry).map_err(|e| {
        execution(ExecutionError::Telemetry {
            message: e.to_string(),
        })
    })?;

    let trace_upload = match tracing_config
        .as_ref()
        .and_then(|tc| tc.tracing_file.as_ref())
    {
        Some(remote) => {
            let local = tracing_file_ref(ctx);
            let metadata =
                transfer::metadata(&ctx.settings.container_id, params.task_id.as_deref());
            transfer::upload_one(&ctx.uploaders, remote, &local, &metadata)
                .await
                .err()
        }
        None => None,
    };

    let code = outcome.return_code;
    match (code, trace_upload) {
        (0, None) => {
            info!("Processing succeeded");
            Ok(telemetry)
        }
        (0, Some(source)) => Err(WorkerError::TraceUpload {
            telemetry: Box::new(telemetry),
            source,
        }),
        (code, None) => Err(WorkerError::NonZeroExit {
            code,
            telemetry: Box::new(telemetry),
        }),
        (code, Some(source)) => Err(WorkerError::NonZeroExitTraceUpload {
            code,
            telemetry: Box::new(telemetry),
            source,
        }),
    }
}

/// Wait for a workload while watching the tracer it was stopped for. A
/// tracer that fails, or exits while the workload is still stopped, gets the
/// workload killed.
async fn wait_traced(
    running: RunningWorkload,
    aggregator: &mut TraceAggregator,
) -> Result<WorkloadOutcome, ExecutionError> {
    let pid = running.pid();
    let wait = running.wait();
    tokio::pin!(wait);

    tokio::select! {
        outcome = &mut wait => outcome,
        exited = aggregator.tracer_exit() => {
            match exited.and_then(|()| trace::ensure_resumed(pid)) {
                Ok(()) => {
                    debug!(pid, "Tracer finished before the workload");
                    wait.await
                }
                Err(e) => {
                    warn!(pid, error = %e, "Tracer ended early, killing workload");
                    trace::halt(pid);
                    if let Err(wait_err) = wait.await {
                        warn!(pid, error = %wait_err, "Could not reap workload");
                    }
                    Err(e.into())
                }
            }
        }
    }
}

/// The tracer log, which the tracer may not have produced.
fn tracing_file_ref(ctx: &WorkerContext) -> LocalFileRef {
    let path = ctx.options.tracing_file();
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    LocalFileRef::new(dir, name).optional()
}
