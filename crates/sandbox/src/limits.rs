//! Resource limits for workload processes.
//!
//! | Name | Resource |
//! |------|----------|
//! | `cpu_usage` | `RLIMIT_CPU` |
//! | `create_file_size` | `RLIMIT_FSIZE` |
//! | `num_open_files` | `RLIMIT_NOFILE` |
//! | `heap_size` | `RLIMIT_DATA` |
//! | `stack_size` | `RLIMIT_STACK` |
//! | `rss_size` | `RLIMIT_RSS` |
//! | `child_processes` | `RLIMIT_NPROC` |
//!
//! Soft and hard limit are both set to the configured value, so the workload
//! cannot raise them again.

use nix::sys::resource::{setrlimit, Resource};
use std::collections::BTreeMap;

use crate::SandboxError;

const LIMIT_TABLE: &[(&str, &str, Resource)] = &[
    ("cpu_usage", "RLIMIT_CPU", Resource::RLIMIT_CPU),
    ("create_file_size", "RLIMIT_FSIZE", Resource::RLIMIT_FSIZE),
    ("num_open_files", "RLIMIT_NOFILE", Resource::RLIMIT_NOFILE),
    ("heap_size", "RLIMIT_DATA", Resource::RLIMIT_DATA),
    ("stack_size", "RLIMIT_STACK", Resource::RLIMIT_STACK),
    ("rss_size", "RLIMIT_RSS", Resource::RLIMIT_RSS),
    ("child_processes", "RLIMIT_NPROC", Resource::RLIMIT_NPROC),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub resource: Resource,
    pub rlimit_name: &'static str,
    pub value: u64,
}

pub(crate) fn resolve(limits: &BTreeMap<String, u64>) -> Result<Vec<ResourceLimit>, SandboxError> {
    limits
        .iter()
        .map(|(name, value)| {
            LIMIT_TABLE
                .iter()
                .find(|(config_name, _, _)| config_name == name)
                .map(|(_, rlimit_name, resource)| ResourceLimit {
                    resource: *resource,
                    rlimit_name,
                    value: *value,
                })
                .ok_or_else(|| SandboxError::UnknownLimit { name: name.clone() })
        })
        .collect()
}

pub(crate) fn apply(limits: &[ResourceLimit]) -> Result<(), SandboxError> {
    for limit in limits {
        setrlimit(limit.resource, limit.value, limit.value).map_err(|source| {
            SandboxError::LimitFailed {
                name: limit.rlimit_name,
                source,
            }
        })?;
    }
    Ok(())
}
