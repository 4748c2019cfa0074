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

//! Per-cell records for notebook runs.
//!
//! One row per (run, code-cell index), built up from the cell protocol lines
//! the notebook runner emits on stdout. stderr accumulates across retries so
//! every failed attempt stays visible.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};

/// Execution state of a single notebook cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellStatus {
    Running,
    Success,
    Failed,
    Retrying,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::Running => "RUNNING",
            CellStatus::Success => "SUCCESS",
            CellStatus::Failed => "FAILED",
            CellStatus::Retrying => "RETRYING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(CellStatus::Running),
            "SUCCESS" => Some(CellStatus::Success),
            "FAILED" => Some(CellStatus::Failed),
            "RETRYING" => Some(CellStatus::Retrying),
            _ => None,
        }
    }
}

/// Cell-level output for a notebook run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCellLog {
    pub run_id: UniversalUuid,
    pub cell_index: i32,
    pub status: CellStatus,
    pub stdout: Option<String>,
    /// Accumulated across retries and the final failure
    pub stderr: Option<String>,
    /// JSON object holding inline images: `{"images": [{"mime", "data"}]}`
    pub outputs: Option<serde_json::Value>,
    pub updated_at: UniversalTimestamp,
}
