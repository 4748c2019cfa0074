/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Shared types for execution backends, plus the pure helpers both backends
//! use: exit-code classification, memory-quantity parsing, and the CPU
//! percentage formula.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discovery::EntryType;

/// Label carrying the run UUID on every launched workload.
pub const RUN_ID_LABEL: &str = "fastflow-run-id";

/// Label carrying the pipeline name on every launched workload.
pub const PIPELINE_LABEL: &str = "fastflow-pipeline";

/// Sentinel printed on stdout immediately before user code begins.
/// Swallowed by the log stream; marks the end of environment setup.
pub const SETUP_READY_MARKER: &str = "FASTFLOW_SETUP_READY";

/// Resource limits resolved for one run (pipeline metadata with any
/// per-schedule override applied).
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Enforced CPU cap in cores
    pub cpu_hard_limit: Option<f64>,
    /// Enforced memory cap, human-readable ("512m", "1g")
    pub mem_hard_limit: Option<String>,
    /// Monitored-only CPU threshold in cores
    pub cpu_soft_limit: Option<f64>,
    /// Monitored-only memory threshold
    pub mem_soft_limit: Option<String>,
}

/// Everything a backend needs to launch one run.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub run_id: Uuid,
    pub pipeline_name: String,
    /// Pipeline directory on the orchestrator's filesystem
    pub pipeline_path: PathBuf,
    pub entry_type: EntryType,
    pub python_version: String,
    pub has_requirements: bool,
    /// Whether a pinned lock file exists next to the manifest
    pub has_lock_file: bool,
    /// Fully merged environment
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
    /// Effective kill deadline; None = unbounded daemon
    pub timeout: Option<Duration>,
}

/// Opaque reference to a launched workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle {
    pub run_id: Uuid,
    /// Container id (Docker) or Job name (Kubernetes)
    pub id: String,
}

/// Observed state of a labelled workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Running,
    Exited { exit_code: i64, oom_killed: bool },
    Unknown,
}

/// A labelled workload found by `list_live_workloads`.
#[derive(Debug, Clone)]
pub struct LiveWorkload {
    pub run_id: Uuid,
    pub pipeline_name: Option<String>,
    pub handle: WorkloadHandle,
    pub state: WorkloadState,
}

/// Terminal result of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadExit {
    pub exit_code: i64,
    pub oom_killed: bool,
}

/// One resource sample.
///
/// `None` fields mean the backend could not observe the value this tick
/// (e.g. the cluster metrics API is unavailable); missing is not zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub ram_mb: Option<f64>,
    pub ram_limit_mb: Option<f64>,
}

/// Exit code the orchestrator records when it killed the workload on
/// timeout.
pub const TIMEOUT_EXIT_CODE: i64 = -1;

/// Classifies an exit code into a human-readable error, per the run's
/// advisory `error_message`. Returns None for success.
pub fn classify_exit_code(exit_code: i64, oom_killed: bool) -> Option<String> {
    if oom_killed || exit_code == 137 {
        return Some("OOM (out of memory): the workload was killed at its memory limit".to_string());
    }
    match exit_code {
        0 => None,
        125 => Some("Runtime error: the container runtime refused to start the workload".to_string()),
        126 => Some("Command not executable (is 'uv' present in the worker image?)".to_string()),
        127 => Some("Command not found (the 'uv run' invocation failed)".to_string()),
        TIMEOUT_EXIT_CODE => Some("Timeout: the workload exceeded its deadline and was killed".to_string()),
        other => Some(format!("Pipeline error (exit code {})", other)),
    }
}

/// True when the exit should be surfaced as an OOM.
pub fn is_oom(exit_code: i64, oom_killed: bool) -> bool {
    oom_killed || exit_code == 137
}

/// Parses a human-readable memory quantity ("512m", "1g", "1024") to bytes.
pub fn parse_memory_limit(raw: &str) -> Result<i64, String> {
    let normalized = raw.trim().to_lowercase();
    let (digits, multiplier) = match normalized.strip_suffix(['k', 'm', 'g']) {
        Some(digits) => {
            let factor = match normalized.as_bytes()[normalized.len() - 1] {
                b'k' => 1024i64,
                b'm' => 1024 * 1024,
                b'g' => 1024 * 1024 * 1024,
                _ => unreachable!(),
            };
            (digits, factor)
        }
        None => (normalized.as_str(), 1),
    };
    digits
        .parse::<i64>()
        .map(|value| value * multiplier)
        .map_err(|_| format!("invalid memory quantity: {:?}", raw))
}

/// Memory quantity in megabytes, for soft-limit comparison.
pub fn memory_limit_mb(raw: &str) -> Option<f64> {
    parse_memory_limit(raw)
        .ok()
        .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
}

/// CPU usage percentage from stats-stream deltas:
/// `(Δcontainer_cpu / Δsystem_cpu) × online_cpus × 100`, clamped to
/// [0, 100] and rounded to two decimals. Undefined when `Δsystem_cpu <= 0`.
pub fn cpu_percent(container_delta: i64, system_delta: i64, online_cpus: u64) -> Option<f64> {
    if system_delta <= 0 {
        return None;
    }
    let cpus = if online_cpus == 0 { 1 } else { online_cpus };
    let pct = (container_delta as f64 / system_delta as f64) * cpus as f64 * 100.0;
    Some((pct.clamp(0.0, 100.0) * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert!(classify_exit_code(0, false).is_none());
    }

    #[test]
    fn test_classify_oom_by_code_or_flag() {
        // Exit 137 or the OOMKilled flag both classify as OOM
        assert!(classify_exit_code(137, false).unwrap().contains("OOM"));
        assert!(classify_exit_code(1, true).unwrap().contains("OOM"));
        assert!(classify_exit_code(0, true).unwrap().contains("OOM"));
        assert!(is_oom(137, false));
        assert!(is_oom(1, true));
        assert!(!is_oom(1, false));
    }

    #[test]
    fn test_classify_special_codes() {
        assert!(classify_exit_code(125, false).unwrap().contains("refused"));
        assert!(classify_exit_code(126, false)
            .unwrap()
            .contains("not executable"));
        assert!(classify_exit_code(127, false).unwrap().contains("not found"));
        assert!(classify_exit_code(-1, false).unwrap().contains("Timeout"));
        assert!(classify_exit_code(3, false).unwrap().contains("exit code 3"));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_limit("  2G ").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("lots").is_err());
        assert!(parse_memory_limit("1.5g").is_err());
        assert!(parse_memory_limit("").is_err());
    }

    #[test]
    fn test_memory_limit_mb() {
        assert_eq!(memory_limit_mb("64m"), Some(64.0));
        assert_eq!(memory_limit_mb("1g"), Some(1024.0));
        assert_eq!(memory_limit_mb("junk"), None);
    }

    #[test]
    fn test_cpu_percent_formula() {
        // 50% of one core on a 4-core host: delta ratio 0.125 × 4 × 100 = 50
        assert_eq!(cpu_percent(125, 1000, 4), Some(50.0));
        // Full usage clamps at 100
        assert_eq!(cpu_percent(5000, 1000, 4), Some(100.0));
        // Undefined when the system delta is not positive
        assert_eq!(cpu_percent(100, 0, 4), None);
        assert_eq!(cpu_percent(100, -5, 4), None);
        // Zero online CPUs falls back to one
        assert_eq!(cpu_percent(500, 1000, 0), Some(50.0));
        // Negative container delta clamps at 0
        assert_eq!(cpu_percent(-10, 1000, 2), Some(0.0));
    }
}
