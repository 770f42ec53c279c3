//! Peak memory of the workload's process tree.
//!
//! A background task samples the root process and every current descendant,
//! sums their resident and virtual sizes and widens the maxima kept under a
//! single mutex. The main flow only reads the maxima, once at `finish`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use task_config::{LocalFileRef, LocalResultFiles, StaticTaskConfig};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::trace::TraceResult;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

const MIB: u64 = 1024 * 1024;

/// Resident and virtual size of one process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub rss: u64,
    pub vms: u64,
}

/// Read access to the process table.
pub trait ProcessInspector: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// All current descendants of `pid`, at any depth.
    fn descendants(&self, pid: u32) -> Vec<u32>;

    /// `None` when the process vanished or cannot be read.
    fn memory(&self, pid: u32) -> Option<MemoryUsage>;
}

/// [`ProcessInspector`] backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    page_size: u64,
}

impl ProcFs {
    pub fn new() -> Self {
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|size| u64::try_from(size).ok())
            .unwrap_or(4096);
        Self {
            root: PathBuf::from("/proc"),
            page_size,
        }
    }

    /// Whether `pid` sits in a job-control or ptrace stop. A vanished process
    /// is not stopped.
    pub fn is_stopped(&self, pid: u32) -> bool {
        fs::read_to_string(self.root.join(pid.to_string()).join("stat"))
            .ok()
            .and_then(|stat| parse_state(&stat))
            .is_some_and(|state| matches!(state, 'T' | 't'))
    }

    fn parent_table(&self) -> HashMap<u32, Vec<u32>> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return children;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = parse_ppid(&stat) {
                children.entry(ppid).or_default().push(pid);
            }
        }
        children
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for ProcFs {
    fn is_alive(&self, pid: u32) -> bool {
        self.root.join(pid.to_string()).exists()
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let table = self.parent_table();
        let mut found = Vec::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            if let Some(children) = table.get(&parent) {
                for &child in children {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        found
    }

    fn memory(&self, pid: u32) -> Option<MemoryUsage> {
        let statm = fs::read_to_string(self.root.join(pid.to_string()).join("statm")).ok()?;
        let mut fields = statm.split_whitespace();
        let size: u64 = fields.next()?.parse().ok()?;
        let resident: u64 = fields.next()?.parse().ok()?;
        Some(MemoryUsage {
            rss: resident * self.page_size,
            vms: size * self.page_size,
        })
    }
}

/// Fields of `/proc/<pid>/stat` after the command name. The name may itself
/// contain spaces and parentheses, so fields start after the last `)`.
fn stat_fields(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    Some(stat[stat.rfind(')')? + 1..].split_whitespace())
}

fn parse_state(stat: &str) -> Option<char> {
    stat_fields(stat)?.next()?.chars().next()
}

fn parse_ppid(stat: &str) -> Option<u32> {
    let mut fields = stat_fields(stat)?;
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// High-water marks in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMaxima {
    pub rss: u64,
    pub vms: u64,
    pub samples: u64,
}

impl MemoryMaxima {
    fn widen(&mut self, usage: MemoryUsage) {
        self.rss = self.rss.max(usage.rss);
        self.vms = self.vms.max(usage.vms);
        self.samples += 1;
    }
}

/// Summed usage of `pid` and its descendants, or `None` once the root is gone.
fn sample_tree(inspector: &dyn ProcessInspector, pid: u32) -> Option<MemoryUsage> {
    if !inspector.is_alive(pid) {
        return None;
    }
    let mut total = MemoryUsage::default();
    for member in std::iter::once(pid).chain(inspector.descendants(pid)) {
        if let Some(usage) = inspector.memory(member) {
            total.rss += usage.rss;
            total.vms += usage.vms;
        }
    }
    Some(total)
}

pub struct ResourceMonitor {
    maxima: Arc<Mutex<MemoryMaxima>>,
    sampler: JoinHandle<()>,
    started: Instant,
}

impl ResourceMonitor {
    /// Sample `pid` through procfs every [`SAMPLE_INTERVAL`], starting now.
    pub fn start(pid: u32) -> Self {
        Self::start_with(pid, Arc::new(ProcFs::new()), SAMPLE_INTERVAL)
    }

    pub fn start_with(pid: u32, inspector: Arc<dyn ProcessInspector>, interval: Duration) -> Self {
        let maxima = Arc::new(Mutex::new(MemoryMaxima::default()));
        let shared = Arc::clone(&maxima);

        let sampler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(usage) = sample_tree(inspector.as_ref(), pid) else {
                    debug!(pid, "Monitored process is gone, sampler stopping");
                    break;
                };
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .widen(usage);
            }
        });

        Self {
            maxima,
            sampler,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MemoryMaxima {
        *self.maxima.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_sampling(&self) -> bool {
        !self.sampler.is_finished()
    }

    /// Stop sampling and build the telemetry for the run. File sizes are read
    /// from the paths declared in `config`.
    pub fn finish(self, config: &StaticTaskConfig) -> TelemetrySnapshot {
        self.sampler.abort();
        let maxima = self.snapshot();
        let wall_time = self.started.elapsed().as_secs_f64();
        debug!(samples = maxima.samples, wall_time, "Resource monitor finished");

        TelemetrySnapshot {
            max_vms_memory: ceil_mib(maxima.vms),
            max_rss_memory: ceil_mib(maxima.rss),
            wall_time,
            input_file_sizes: config.local_input_files.iter().map(file_size).collect(),
            result_file_sizes: ResultFileSizes::collect(&config.local_result_files),
            std_out: None,
            std_err: None,
            return_code: None,
            tracing: None,
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.sampler.abort();
    }
}

fn ceil_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSize {
    pub local_file_path: String,
    /// MiB, rounded up.
    pub file_size: u64,
}

fn file_size(local: &LocalFileRef) -> Option<FileSize> {
    let path = local.path();
    let meta = fs::metadata(&path).ok().filter(|m| m.is_file())?;
    Some(FileSize {
        local_file_path: path.display().to_string(),
        file_size: ceil_mib(meta.len()),
    })
}

/// Result sizes in the same shape as the declared result files. Missing
/// files are `null` in a list and left out of a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResultFileSizes {
    List(Vec<Option<FileSize>>),
    Keyed(BTreeMap<String, FileSize>),
}

impl ResultFileSizes {
    fn collect(files: &LocalResultFiles) -> Self {
        match files {
            LocalResultFiles::List(files) => {
                ResultFileSizes::List(files.iter().map(file_size).collect())
            }
            LocalResultFiles::Keyed(files) => ResultFileSizes::Keyed(
                files
                    .iter()
                    .filter_map(|(key, local)| file_size(local).map(|size| (key.clone(), size)))
                    .collect(),
            ),
        }
    }
}

/// Telemetry attached to the `processed` report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub max_vms_memory: u64,
    pub max_rss_memory: u64,
    pub wall_time: f64,
    pub input_file_sizes: Vec<Option<FileSize>>,
    pub result_file_sizes: ResultFileSizes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_out: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TraceResult>,
}
