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

//! Pipeline run records.
//!
//! A run is created `Pending` by the orchestrator, moves to `Running` once the
//! backend confirms the workload is launching, and reaches exactly one
//! terminal status after both wait-for-exit and log drain complete. Terminal
//! states never transition back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::error::RunErrorType;

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Stopped by a user or by graceful shutdown
    Interrupted,
    /// Shutdown could not stop the workload cleanly
    Warning,
}

impl RunStatus {
    /// Storage representation (uppercase TEXT).
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Interrupted => "INTERRUPTED",
            RunStatus::Warning => "WARNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RunStatus::Pending),
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "FAILED" => Some(RunStatus::Failed),
            "INTERRUPTED" => Some(RunStatus::Interrupted),
            "WARNING" => Some(RunStatus::Warning),
            _ => None,
        }
    }

    /// Terminal statuses never transition back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Interrupted | RunStatus::Warning
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: UniversalUuid,
    pub pipeline_name: String,
    pub status: RunStatus,
    /// Path of the append-only log file
    pub log_file: String,
    /// Path of the JSON-Lines metrics file, once sampling started
    pub metrics_file: Option<String>,
    /// Snapshot of the merged environment the workload ran with
    pub env_vars: HashMap<String, String>,
    /// Snapshot of ad-hoc caller parameters
    pub parameters: HashMap<String, String>,
    /// uv version inside the worker, for reproducibility
    pub uv_version: Option<String>,
    /// Seconds from workload creation to the setup-ready sentinel
    pub setup_duration: Option<f64>,
    pub started_at: UniversalTimestamp,
    pub finished_at: Option<UniversalTimestamp>,
    pub exit_code: Option<i64>,
    /// Trigger source: manual, webhook, scheduler, downstream, daemon_restart,
    /// or `<source>_retry`
    pub triggered_by: String,
    /// Named schedule this run was configured from, if any
    pub run_config_id: Option<String>,
    /// Advisory failure classification
    pub error_type: Option<RunErrorType>,
    pub error_message: Option<String>,
    /// Container id or Job name
    pub workload_id: Option<String>,
    pub created_at: UniversalTimestamp,
    pub updated_at: UniversalTimestamp,
}

impl PipelineRun {
    /// Retry count carried in the env snapshot (`_fastflow_retry_count`).
    pub fn retry_count(&self) -> u32 {
        self.env_vars
            .get("_fastflow_retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Fields required to create a new run row.
#[derive(Debug, Clone)]
pub struct NewPipelineRun {
    pub pipeline_name: String,
    pub log_file: String,
    pub env_vars: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub triggered_by: String,
    pub run_config_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Interrupted,
            RunStatus::Warning,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Interrupted.is_terminal());
        assert!(RunStatus::Warning.is_terminal());
    }
}
