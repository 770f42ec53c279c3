//! Command-line and environment configuration for the worker binary.

use clap::Parser;
use std::path::PathBuf;

/// Worker options. The launch settings document is the only positional
/// argument; everything else has an environment fallback.
#[derive(Debug, Clone, Parser)]
#[command(name = "container-worker")]
#[command(about = "Runs one task inside a compute container and reports each phase to the controller")]
pub struct WorkerOptions {
    /// Launch settings as a JSON document
    pub settings: String,

    /// Static task config baked into the image
    #[arg(long, env = "CC_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// External tracer program used when the task asks for tracing
    #[arg(long, env = "CC_TRACER_BIN")]
    pub tracer_bin: Option<PathBuf>,

    /// Directory receiving the tracer log
    #[arg(long, env = "CC_TRACING_DIR", default_value = "/var/tmp/cc-tracing")]
    pub tracing_dir: PathBuf,

    /// Staging directory for data containers
    #[arg(long, env = "CC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Listen address of the peer file server
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:80")]
    pub bind_addr: String,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl WorkerOptions {
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(task_config::default_config_path)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(dirs_home)
            .unwrap_or_else(|| PathBuf::from("/root"))
    }

    /// Tracer log written by the external tracer and uploaded afterwards.
    pub fn tracing_file(&self) -> PathBuf {
        self.tracing_dir.join("data.jsonl")
    }

    /// Options with defaults, for callers that drive the worker as a library.
    pub fn with_settings(settings: impl Into<String>) -> Self {
        Self {
            settings: settings.into(),
            config_path: None,
            tracer_bin: None,
            tracing_dir: PathBuf::from("/var/tmp/cc-tracing"),
            data_dir: None,
            bind_addr: "0.0.0.0:80".to_string(),
            log_json: false,
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
