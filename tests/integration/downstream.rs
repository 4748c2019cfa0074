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

use std::time::Duration;

use fastflow::discovery::PipelineDiscovery;
use fastflow::models::NewDownstreamTrigger;
use fastflow::triggers::resolve_downstream;

use crate::test_dal;

fn write_pipeline(root: &std::path::Path, name: &str, metadata: Option<&str>) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.py"), "print('hi')\n").unwrap();
    if let Some(json) = metadata {
        std::fs::write(dir.join("pipeline.json"), json).unwrap();
    }
}

#[tokio::test]
async fn test_union_of_metadata_and_store_triggers() {
    let dal = test_dal().await;
    let tmp = tempfile::tempdir().unwrap();
    write_pipeline(
        tmp.path(),
        "a",
        Some(r#"{"downstream_triggers": [{"pipeline": "b", "on_success": true}]}"#),
    );
    write_pipeline(tmp.path(), "b", None);
    write_pipeline(tmp.path(), "c", None);
    let discovery = PipelineDiscovery::new(tmp.path(), Duration::from_secs(60));

    dal.downstream_trigger()
        .create(NewDownstreamTrigger {
            upstream_pipeline: "a".to_string(),
            downstream_pipeline: "c".to_string(),
            on_success: true,
            on_failure: false,
            enabled: true,
        })
        .await
        .unwrap();

    let targets = resolve_downstream(&discovery, &dal, "a", true).await;
    let names: Vec<&str> = targets.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);

    // Nothing fires on failure for these triggers
    assert!(resolve_downstream(&discovery, &dal, "a", false).await.is_empty());
}

#[tokio::test]
async fn test_dedup_prefers_metadata_run_config() {
    let dal = test_dal().await;
    let tmp = tempfile::tempdir().unwrap();
    write_pipeline(
        tmp.path(),
        "a",
        Some(r#"{"downstream_triggers": [{"pipeline": "b", "run_config_id": "prod"}]}"#),
    );
    write_pipeline(tmp.path(), "b", None);
    let discovery = PipelineDiscovery::new(tmp.path(), Duration::from_secs(60));

    // The store declares the same downstream; dedup keeps one entry with the
    // metadata-declared run config
    dal.downstream_trigger()
        .create(NewDownstreamTrigger {
            upstream_pipeline: "a".to_string(),
            downstream_pipeline: "b".to_string(),
            on_success: true,
            on_failure: false,
            enabled: true,
        })
        .await
        .unwrap();

    let targets = resolve_downstream(&discovery, &dal, "a", true).await;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, "b");
    assert_eq!(targets[0].1.as_deref(), Some("prod"));
}

#[tokio::test]
async fn test_on_failure_and_disabled_rows() {
    let dal = test_dal().await;
    let tmp = tempfile::tempdir().unwrap();
    write_pipeline(tmp.path(), "a", None);
    let discovery = PipelineDiscovery::new(tmp.path(), Duration::from_secs(60));

    let failure_trigger = dal
        .downstream_trigger()
        .create(NewDownstreamTrigger {
            upstream_pipeline: "a".to_string(),
            downstream_pipeline: "alert".to_string(),
            on_success: false,
            on_failure: true,
            enabled: true,
        })
        .await
        .unwrap();
    dal.downstream_trigger()
        .create(NewDownstreamTrigger {
            upstream_pipeline: "a".to_string(),
            downstream_pipeline: "disabled-target".to_string(),
            on_success: true,
            on_failure: true,
            enabled: false,
        })
        .await
        .unwrap();

    let on_failure = resolve_downstream(&discovery, &dal, "a", false).await;
    assert_eq!(on_failure.len(), 1);
    assert_eq!(on_failure[0].0, "alert");

    assert!(resolve_downstream(&discovery, &dal, "a", true).await.is_empty());

    // Disabling the failure trigger empties the set
    dal.downstream_trigger()
        .set_enabled(failure_trigger.id, false)
        .await
        .unwrap();
    assert!(resolve_downstream(&discovery, &dal, "a", false).await.is_empty());
}
