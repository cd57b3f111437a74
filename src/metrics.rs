/// Live metrics for the TUI monitor.
///
/// When enabled, the verifier writes a JSON snapshot after every pipeline
/// stage. The viz binary polls the file and re-renders the dashboard.
/// Writes are atomic (write to .tmp then rename) to avoid torn reads.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const METRICS_PATH: &str = "/tmp/ptxverify_live.json";

/// Default snapshot location shared by the verifier and the monitor
pub fn default_path() -> PathBuf {
    PathBuf::from(METRICS_PATH)
}

/// Time spent in one stage, as shown by the monitor.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct StageSnapshot {
    pub stage: String,
    pub millis: f64,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    /// "idle" | "running" | "complete" | "failed"
    pub status: String,
    pub kernel_name: String,
    /// Stage currently running (or last finished)
    pub stage: String,
    pub stages_completed: usize,
    pub stages_total: usize,
    /// Block dimensions [x, y, z]
    pub block: [u32; 3],
    pub threads: usize,
    pub warps: usize,
    /// Whether warps are emulated in lock-step
    pub lock_step: bool,
    pub dynamic_instructions: u64,
    pub shared_accesses: usize,
    pub barrier_instances: usize,
    pub races: usize,
    pub barrier_findings: usize,
    /// Worker threads in the task pool
    pub pool_size: usize,
    pub timings: Vec<StageSnapshot>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

impl LiveMetrics {
    /// Fraction of the pipeline finished, in [0, 1]
    pub fn progress(&self) -> f64 {
        if self.stages_total == 0 {
            return 0.0;
        }
        (self.stages_completed as f64 / self.stages_total as f64).min(1.0)
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write metrics to `path`.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_metrics(path: &Path, metrics: &LiveMetrics) {
    if let Ok(json) = serde_json::to_string(metrics) {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        if std::fs::write(&tmp, &json).is_ok() {
            let _ = std::fs::rename(&tmp, path);
        }
    }
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no verification has run yet).
pub fn read_metrics(path: &Path) -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
