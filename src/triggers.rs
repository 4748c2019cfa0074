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

//! Downstream trigger resolution (pipeline chaining).
//!
//! Triggers come from two independent sources: `downstream_triggers` declared
//! in the upstream's metadata, and enabled rows in the relational store. Both
//! are unioned, filtered by the event (success or failure), deduplicated by
//! downstream name, and returned in sorted order. A metadata-declared
//! trigger's `run_config_id` survives deduplication.

use std::collections::BTreeMap;

use tracing::warn;

use crate::dal::DAL;
use crate::discovery::PipelineDiscovery;

/// A downstream pipeline to submit, with the named schedule to apply.
pub type DownstreamTarget = (String, Option<String>);

/// Resolves the ordered set of downstream pipelines for an upstream event.
pub async fn resolve_downstream(
    discovery: &PipelineDiscovery,
    dal: &DAL,
    upstream: &str,
    on_success: bool,
) -> Vec<DownstreamTarget> {
    // BTreeMap gives dedup-by-name and sorted order in one structure
    let mut targets: BTreeMap<String, Option<String>> = BTreeMap::new();

    match discovery.get(upstream) {
        Ok(Some(pipeline)) => {
            for trigger in &pipeline.metadata.downstream_triggers {
                let fires = (on_success && trigger.on_success)
                    || (!on_success && trigger.on_failure);
                if fires {
                    targets
                        .entry(trigger.pipeline.clone())
                        .or_insert_with(|| trigger.run_config_id.clone());
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(upstream, error = %e, "Discovery failed during trigger resolution");
        }
    }

    match dal.downstream_trigger().list_enabled_for(upstream).await {
        Ok(rows) => {
            for row in rows {
                let fires =
                    (on_success && row.on_success) || (!on_success && row.on_failure);
                if fires {
                    targets.entry(row.downstream_pipeline).or_insert(None);
                }
            }
        }
        Err(e) => {
            warn!(upstream, error = %e, "Failed to load stored downstream triggers");
        }
    }

    targets.into_iter().collect()
}
