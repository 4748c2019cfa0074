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

//! Pipeline aggregate record.
//!
//! One row per discovered pipeline, keyed by name. Carries the run counters
//! and the cache-warmup timestamp. Counters are only ever changed by atomic
//! conditional updates in the DAL (never read-modify-write) and never
//! decremented except through an explicit reset.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::UniversalTimestamp;

/// Aggregate pipeline record in the `pipelines` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (directory name under the pipelines root)
    pub pipeline_name: String,
    /// Whether a requirements.txt was found at last discovery
    pub has_requirements: bool,
    /// Timestamp of the last successful dependency pre-heat
    pub last_cache_warmup: Option<UniversalTimestamp>,
    /// Total number of runs (resettable counter)
    pub total_runs: i32,
    /// Number of successful runs
    pub successful_runs: i32,
    /// Number of failed runs
    pub failed_runs: i32,
    /// Number of webhook-triggered runs
    pub webhook_runs: i32,
}
