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

//! Store-declared pipeline chaining links.
//!
//! Independent of the triggers declared in pipeline metadata; both sources
//! are unioned at resolution time.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};

/// A chaining link from one pipeline to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamTrigger {
    pub id: UniversalUuid,
    pub upstream_pipeline: String,
    pub downstream_pipeline: String,
    pub on_success: bool,
    pub on_failure: bool,
    pub enabled: bool,
    pub created_at: UniversalTimestamp,
}

#[derive(Debug, Clone)]
pub struct NewDownstreamTrigger {
    pub upstream_pipeline: String,
    pub downstream_pipeline: String,
    pub on_success: bool,
    pub on_failure: bool,
    pub enabled: bool,
}
