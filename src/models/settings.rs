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

//! Runtime orchestrator settings.
//!
//! A singleton row (id = 1). Set fields override the corresponding
//! environment defaults; unset fields fall through.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::UniversalTimestamp;

/// Mutable runtime configuration, singleton row id = 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub id: i32,
    pub log_retention_runs: Option<i32>,
    pub log_retention_days: Option<i32>,
    pub log_max_size_mb: Option<i32>,
    pub max_concurrent_runs: Option<i32>,
    /// Cron expression for the dependency audit job
    pub dependency_audit_cron: Option<String>,
    /// Vault-encrypted git sync credentials
    pub git_sync_credentials: Option<String>,
    pub updated_at: UniversalTimestamp,
}

impl OrchestratorSettings {
    pub const SINGLETON_ID: i32 = 1;
}
