//! Confinement policy for workload processes.
//!
//! A [`SandboxConfig`] arrives with the controller's task parameters. [`build`]
//! turns it into an [`Activation`]: every fallible step (limit name lookup,
//! BPF compilation) happens in the parent, so the child only has to install
//! what was prepared for it.
//!
//! Activation runs between fork and exec and applies its steps in order:
//!
//! 1. **ResourceLimits** - `setrlimit` with soft = hard for each named ceiling
//! 2. **SyscallFilter** - load the compiled seccomp program
//!
//! Either step may be absent. An empty activation is a no-op.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;
use tracing::debug;

mod limits;
mod seccomp;

pub use limits::ResourceLimit;
pub use seccomp::{ConditionOperator, FilterCondition, FilterItem, SeccompConfig, SeccompMode};

/// Errno returned by syscalls a filter rejects, unless configured otherwise.
pub const DEFAULT_TERMINATION_EXIT_CODE: u32 = 1234;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox config: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown resource limit: {name}")]
    UnknownLimit { name: String },

    #[error("Syscall argument index {index} out of range (0-5)")]
    ArgumentIndex { index: u8 },

    #[error("Unsupported target architecture: {arch}")]
    UnsupportedArch { arch: String },

    #[error("Seccomp filter compilation failed: {message}")]
    FilterCompilation { message: String },

    #[error("Failed to set {name}: {source}")]
    LimitFailed {
        name: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to load seccomp filter: {source}")]
    FilterLoad {
        #[source]
        source: seccompiler::Error,
    },
}

/// Raw errno only: this conversion runs in the forked child.
impl From<SandboxError> for io::Error {
    fn from(err: SandboxError) -> Self {
        let errno = match err {
            SandboxError::LimitFailed { source, .. } => source,
            SandboxError::FilterLoad { .. } => Errno::EPERM,
            _ => Errno::EINVAL,
        };
        io::Error::from_raw_os_error(errno as i32)
    }
}

/// Declarative policy as sent by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Limit name (`cpu_usage`, `heap_size`, ...) to ceiling.
    #[serde(default)]
    pub limits: BTreeMap<String, u64>,
    #[serde(default)]
    pub seccomp: Option<SeccompConfig>,
}

impl SandboxConfig {
    pub fn from_value(value: &Value) -> Result<Self, SandboxError> {
        serde_json::from_value(value.clone()).map_err(|e| SandboxError::InvalidConfig {
            message: e.to_string(),
        })
    }
}

/// One independently toggleable piece of confinement.
#[derive(Debug, Clone)]
pub enum ConfinementStep {
    ResourceLimits(Vec<ResourceLimit>),
    SyscallFilter(seccompiler::BpfProgram),
}

impl ConfinementStep {
    pub fn name(&self) -> &'static str {
        match self {
            ConfinementStep::ResourceLimits(_) => "resource_limits",
            ConfinementStep::SyscallFilter(_) => "syscall_filter",
        }
    }

    pub fn apply(&self) -> Result<(), SandboxError> {
        match self {
            ConfinementStep::ResourceLimits(limits) => limits::apply(limits),
            ConfinementStep::SyscallFilter(program) => seccomp::install(program),
        }
    }
}

/// Prepared confinement, run exactly once in the child before exec.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    steps: Vec<ConfinementStep>,
}

impl Activation {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[ConfinementStep] {
        &self.steps
    }

    /// Apply every step in order, stopping at the first failure.
    ///
    /// Intended for a `pre_exec` hook, so it must not log or allocate beyond
    /// what the steps themselves need.
    pub fn activate(&self) -> Result<(), SandboxError> {
        for step in &self.steps {
            step.apply()?;
        }
        Ok(())
    }
}

/// Compile `config` into an [`Activation`]. `None` yields a no-op.
pub fn build(config: Option<&SandboxConfig>) -> Result<Activation, SandboxError> {
    let Some(config) = config else {
        return Ok(Activation::noop());
    };

    let mut steps = Vec::new();

    let limits = limits::resolve(&config.limits)?;
    if !limits.is_empty() {
        steps.push(ConfinementStep::ResourceLimits(limits));
    }

    if let Some(seccomp) = &config.seccomp {
        if let Some(program) = seccomp::compile(seccomp)? {
            steps.push(ConfinementStep::SyscallFilter(program));
        }
    }

    debug!(
        steps = ?steps.iter().map(ConfinementStep::name).collect::<Vec<_>>(),
        "Sandbox activation prepared"
    );

    Ok(Activation { steps })
}

/// Parse the raw `sandbox` value from task parameters and build it.
pub fn build_from_value(value: Option<&Value>) -> Result<Activation, SandboxError> {
    match value {
        None | Some(Value::Null) => Ok(Activation::noop()),
        Some(raw) => build(Some(&SandboxConfig::from_value(raw)?)),
    }
}
