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

use std::collections::HashMap;

use fastflow::database::universal_types::UniversalUuid;
use fastflow::error::{RunErrorType, ValidationError};
use fastflow::models::{
    JobKind, JobSource, NewPipelineRun, NewScheduledJob, RunStatus, TriggerType,
};

use crate::test_dal;

fn new_run(pipeline: &str) -> NewPipelineRun {
    NewPipelineRun {
        pipeline_name: pipeline.to_string(),
        log_file: format!("/tmp/{}.log", pipeline),
        env_vars: HashMap::from([("KEY".to_string(), "value".to_string())]),
        parameters: HashMap::new(),
        triggered_by: "manual".to_string(),
        run_config_id: None,
    }
}

#[tokio::test]
async fn test_run_create_and_get_round_trip() {
    let dal = test_dal().await;
    let run = dal.pipeline_run().create(new_run("etl")).await.unwrap();

    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.pipeline_name, "etl");
    assert_eq!(run.env_vars.get("KEY").map(String::as_str), Some("value"));
    assert!(run.finished_at.is_none());

    let fetched = dal.pipeline_run().get(run.id).await.unwrap();
    assert_eq!(fetched.id, run.id);
    assert_eq!(fetched.triggered_by, "manual");
}

#[tokio::test]
async fn test_run_get_missing_is_not_found() {
    let dal = test_dal().await;
    let result = dal.pipeline_run().get(UniversalUuid::new_v4()).await;
    assert!(matches!(result, Err(ValidationError::NotFound(_))));
}

#[tokio::test]
async fn test_run_lifecycle_transitions() {
    let dal = test_dal().await;
    let run = dal.pipeline_run().create(new_run("etl")).await.unwrap();

    dal.pipeline_run().set_workload(run.id, "c0ffee").await.unwrap();
    dal.pipeline_run().mark_running(run.id).await.unwrap();
    let running = dal.pipeline_run().get(run.id).await.unwrap();
    assert_eq!(running.status, RunStatus::Running);
    assert_eq!(running.workload_id.as_deref(), Some("c0ffee"));

    let finalized = dal
        .pipeline_run()
        .finalize(
            run.id,
            RunStatus::Failed,
            Some(1),
            Some(RunErrorType::PipelineError),
            Some("Pipeline error (exit code 1)".to_string()),
        )
        .await
        .unwrap();
    assert!(finalized);

    let finished = dal.pipeline_run().get(run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.exit_code, Some(1));
    assert!(finished.finished_at.is_some());
    assert!(finished.started_at <= finished.finished_at.unwrap());
    assert_eq!(finished.error_type, Some(RunErrorType::PipelineError));
}

#[tokio::test]
async fn test_finalize_never_leaves_terminal() {
    let dal = test_dal().await;
    let run = dal.pipeline_run().create(new_run("etl")).await.unwrap();

    assert!(dal
        .pipeline_run()
        .finalize(run.id, RunStatus::Interrupted, None, None, None)
        .await
        .unwrap());

    // A racing finalisation is a no-op against the terminal row
    let second = dal
        .pipeline_run()
        .finalize(run.id, RunStatus::Success, Some(0), None, None)
        .await
        .unwrap();
    assert!(!second);
    assert_eq!(
        dal.pipeline_run().get(run.id).await.unwrap().status,
        RunStatus::Interrupted
    );

    // mark_running cannot resurrect a terminal run either
    dal.pipeline_run().mark_running(run.id).await.unwrap();
    assert_eq!(
        dal.pipeline_run().get(run.id).await.unwrap().status,
        RunStatus::Interrupted
    );
}

#[tokio::test]
async fn test_count_active() {
    let dal = test_dal().await;
    let a = dal.pipeline_run().create(new_run("etl")).await.unwrap();
    let _b = dal.pipeline_run().create(new_run("etl")).await.unwrap();
    let _other = dal.pipeline_run().create(new_run("unrelated")).await.unwrap();

    assert_eq!(dal.pipeline_run().count_active("etl").await.unwrap(), 2);

    dal.pipeline_run()
        .finalize(a.id, RunStatus::Success, Some(0), None, None)
        .await
        .unwrap();
    assert_eq!(dal.pipeline_run().count_active("etl").await.unwrap(), 1);
}

#[tokio::test]
async fn test_pipeline_counters_accumulate() {
    let dal = test_dal().await;

    dal.pipeline().record_run_outcome("etl", true, false).await.unwrap();
    dal.pipeline().record_run_outcome("etl", false, false).await.unwrap();
    dal.pipeline().record_run_outcome("etl", true, true).await.unwrap();
    dal.pipeline().record_run_interrupted("etl").await.unwrap();

    let pipeline = dal.pipeline().get("etl").await.unwrap().unwrap();
    assert_eq!(pipeline.total_runs, 4);
    assert_eq!(pipeline.successful_runs, 2);
    assert_eq!(pipeline.failed_runs, 1);
    assert_eq!(pipeline.webhook_runs, 1);
    // total == successful + failed + interrupted
    assert_eq!(
        pipeline.total_runs,
        pipeline.successful_runs + pipeline.failed_runs + 1
    );

    dal.pipeline().reset_counters("etl").await.unwrap();
    let reset = dal.pipeline().get("etl").await.unwrap().unwrap();
    assert_eq!(reset.total_runs, 0);
    assert_eq!(reset.successful_runs, 0);
}

#[tokio::test]
async fn test_cache_warmup_recorded() {
    let dal = test_dal().await;
    assert!(dal.pipeline().get("etl").await.unwrap().is_none());

    dal.pipeline().record_cache_warmup("etl").await.unwrap();
    let pipeline = dal.pipeline().get("etl").await.unwrap().unwrap();
    assert!(pipeline.has_requirements);
    assert!(pipeline.last_cache_warmup.is_some());
}

#[tokio::test]
async fn test_retention_queries() {
    let dal = test_dal().await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        let run = dal.pipeline_run().create(new_run("etl")).await.unwrap();
        dal.pipeline_run()
            .finalize(run.id, RunStatus::Success, Some(0), None, None)
            .await
            .unwrap();
        ids.push(run.id);
        // Distinct started_at values for a stable order
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    // One still-running run never shows up in retention results
    let live = dal.pipeline_run().create(new_run("etl")).await.unwrap();

    let beyond = dal.pipeline_run().terminal_runs_beyond("etl", 2).await.unwrap();
    assert_eq!(beyond.len(), 3);
    assert!(beyond.iter().all(|r| r.status.is_terminal()));
    assert!(!beyond.iter().any(|r| r.id == live.id));

    let future = (chrono::Utc::now() + chrono::Duration::days(1)).to_rfc3339();
    let aged = dal
        .pipeline_run()
        .terminal_runs_started_before(&future)
        .await
        .unwrap();
    assert_eq!(aged.len(), 5);

    dal.pipeline_run().delete(ids[0]).await.unwrap();
    assert!(matches!(
        dal.pipeline_run().get(ids[0]).await,
        Err(ValidationError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_scheduled_job_duplicate_rejected() {
    let dal = test_dal().await;
    let job = NewScheduledJob {
        pipeline_name: "etl".to_string(),
        trigger_type: TriggerType::Cron,
        trigger_value: "0 9 * * *".to_string(),
        enabled: true,
        source: JobSource::Api,
        kind: JobKind::Submit,
        start_at: None,
        end_at: None,
        run_config_id: None,
    };
    dal.scheduled_job().create(job.clone()).await.unwrap();
    assert!(dal.scheduled_job().create(job).await.is_err());
    assert_eq!(dal.scheduled_job().list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replace_metadata_jobs_preserves_api_jobs() {
    let dal = test_dal().await;
    let api_job = dal
        .scheduled_job()
        .create(NewScheduledJob {
            pipeline_name: "etl".to_string(),
            trigger_type: TriggerType::Cron,
            trigger_value: "0 9 * * *".to_string(),
            enabled: true,
            source: JobSource::Api,
            kind: JobKind::Submit,
            start_at: None,
            end_at: None,
            run_config_id: None,
        })
        .await
        .unwrap();
    dal.scheduled_job()
        .create(NewScheduledJob {
            pipeline_name: "etl".to_string(),
            trigger_type: TriggerType::Interval,
            trigger_value: "600".to_string(),
            enabled: true,
            source: JobSource::PipelineJson,
            kind: JobKind::Submit,
            start_at: None,
            end_at: None,
            run_config_id: None,
        })
        .await
        .unwrap();

    // Metadata now declares a different schedule
    dal.scheduled_job()
        .replace_metadata_jobs(
            "etl",
            vec![NewScheduledJob {
                pipeline_name: "etl".to_string(),
                trigger_type: TriggerType::Interval,
                trigger_value: "300".to_string(),
                enabled: true,
                source: JobSource::PipelineJson,
                kind: JobKind::Submit,
                start_at: None,
                end_at: None,
                run_config_id: None,
            }],
        )
        .await
        .unwrap();

    let jobs = dal.scheduled_job().list().await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|j| j.id == api_job.id));
    let metadata_job = jobs
        .iter()
        .find(|j| j.source == JobSource::PipelineJson)
        .unwrap();
    assert_eq!(metadata_job.trigger_value, "300");
}

#[tokio::test]
async fn test_cell_logs_accumulate_across_retries() {
    let dal = test_dal().await;
    let run_id = UniversalUuid::new_v4();

    dal.cell_log()
        .upsert_status(run_id, 0, fastflow::models::CellStatus::Running)
        .await
        .unwrap();
    dal.cell_log()
        .append_stream(run_id, 0, true, "--- retry attempt 1 failed ---\nboom\n\n")
        .await
        .unwrap();
    dal.cell_log()
        .append_stream(run_id, 0, true, "--- retry attempt 2 failed ---\nboom again\n\n")
        .await
        .unwrap();
    dal.cell_log()
        .append_stream(run_id, 0, false, "partial output\n")
        .await
        .unwrap();
    dal.cell_log()
        .append_image(run_id, 0, "image/png", "QUJD")
        .await
        .unwrap();
    dal.cell_log()
        .upsert_status(run_id, 0, fastflow::models::CellStatus::Success)
        .await
        .unwrap();

    let cells = dal.cell_log().list_for_run(run_id).await.unwrap();
    assert_eq!(cells.len(), 1);
    let cell = &cells[0];
    assert_eq!(cell.status, fastflow::models::CellStatus::Success);
    let stderr = cell.stderr.as_deref().unwrap();
    assert!(stderr.contains("retry attempt 1"));
    assert!(stderr.contains("retry attempt 2"));
    assert_eq!(cell.stdout.as_deref(), Some("partial output\n"));
    let images = cell.outputs.as_ref().unwrap()["images"].as_array().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0]["mime"], "image/png");
}

#[tokio::test]
async fn test_settings_singleton_round_trip() {
    let dal = test_dal().await;
    assert!(dal.settings().get().await.unwrap().is_none());

    let settings = fastflow::models::OrchestratorSettings {
        id: fastflow::models::OrchestratorSettings::SINGLETON_ID,
        log_retention_runs: Some(20),
        log_retention_days: None,
        log_max_size_mb: Some(50),
        max_concurrent_runs: Some(4),
        dependency_audit_cron: Some("0 4 * * *".to_string()),
        git_sync_credentials: None,
        updated_at: fastflow::database::universal_types::current_timestamp(),
    };
    dal.settings().upsert(&settings).await.unwrap();

    let stored = dal.settings().get().await.unwrap().unwrap();
    assert_eq!(stored.log_retention_runs, Some(20));
    assert_eq!(stored.max_concurrent_runs, Some(4));

    // Second write updates in place
    let mut updated = stored.clone();
    updated.log_retention_runs = Some(5);
    dal.settings().upsert(&updated).await.unwrap();
    assert_eq!(
        dal.settings().get().await.unwrap().unwrap().log_retention_runs,
        Some(5)
    );
}
