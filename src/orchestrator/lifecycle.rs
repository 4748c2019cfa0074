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

//! Per-run lifecycle task.
//!
//! One task per run: pre-heat (serialised per pipeline) → submit → attach
//! log/metric pumps → wait → drain → finalise → update stats → downstream
//! triggers → retry. Log streaming, metric streaming, and wait-for-exit run
//! concurrently; finalisation joins them, so a reader opening the persisted
//! log after `finished_at` sees the full final content.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::database::universal_types::UniversalUuid;
use crate::discovery::{DiscoveredPipeline, EntryType};
use crate::error::RunErrorType;
use crate::executor::types::{classify_exit_code, is_oom, WorkloadExit};
use crate::executor::{WorkloadHandle, WorkloadSpec};
use crate::models::{PipelineRun, RunStatus};
use crate::orchestrator::streams::{self, LogPumpOptions};
use crate::orchestrator::{
    EffectiveRunSettings, Orchestrator, SubmitRequest, PREVIOUS_RUN_ENV, RETRY_COUNT_ENV,
};
use crate::retry;

/// Time allowed for the setup-ready sentinel before `setup_duration` is
/// recorded as unknown.
const SETUP_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause after exit before cancelling the pumps, letting raced lines land.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Attempts for the terminal status write before leaving the row to the
/// zombie reconciler.
const FINALIZE_ATTEMPTS: u32 = 3;

pub(crate) async fn run_lifecycle(
    orchestrator: Orchestrator,
    run: PipelineRun,
    pipeline: Arc<DiscoveredPipeline>,
    effective: EffectiveRunSettings,
) {
    let run_id = run.id;

    // Serialise against any in-flight pre-heat, then make sure the
    // environment is warm before the container starts
    let python_version = pipeline
        .python_version(&orchestrator.config.default_python_version)
        .to_string();
    if orchestrator.config.uv_pre_heat && pipeline.has_requirements {
        let outcome = orchestrator.preheater.preheat(&pipeline, &python_version).await;
        if !outcome.success {
            warn!(run_id = %run_id, message = %outcome.message, "Pre-heat failed; run will resolve at startup");
        }
    } else {
        orchestrator
            .preheater
            .ensure_python_version(&python_version)
            .await;
    }

    // A cancel may have landed while pre-heating
    match orchestrator.dal.pipeline_run().get(run_id).await {
        Ok(current) if current.status.is_terminal() => {
            debug!(run_id = %run_id, "Run was cancelled before launch");
            orchestrator.registry.remove(run_id.0);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Run row vanished before launch");
            orchestrator.registry.remove(run_id.0);
            return;
        }
    }

    let spec = WorkloadSpec {
        run_id: run_id.0,
        pipeline_name: pipeline.name.clone(),
        pipeline_path: pipeline.path.clone(),
        entry_type: pipeline.entry_type(),
        python_version,
        has_requirements: pipeline.has_requirements,
        has_lock_file: pipeline.lock_file().is_file(),
        env: run.env_vars.clone(),
        limits: effective.limits.clone(),
        timeout: effective.timeout,
    };

    let submit_started = tokio::time::Instant::now();
    let handle = match orchestrator.backend.submit(&spec).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Workload submission failed");
            finalize_infrastructure_failure(&orchestrator, &run, &pipeline, e.to_string())
                .await;
            return;
        }
    };
    orchestrator.registry.set_handle(run_id.0, handle.clone());
    if let Err(e) = orchestrator
        .dal
        .pipeline_run()
        .set_workload(run_id, &handle.id)
        .await
    {
        warn!(run_id = %run_id, error = %e, "Failed to record workload id");
    }
    if let Err(e) = orchestrator.dal.pipeline_run().mark_running(run_id).await {
        warn!(run_id = %run_id, error = %e, "Failed to mark run RUNNING");
    }

    // Attach the streams. Queues are guaranteed present: the registry entry
    // was created at admission.
    let log_queue = orchestrator
        .registry
        .log_sender(run_id.0)
        .unwrap_or_else(|| tokio::sync::broadcast::channel(1).0);
    let metric_queue = orchestrator
        .registry
        .metric_sender(run_id.0)
        .unwrap_or_else(|| tokio::sync::broadcast::channel(1).0);

    let (setup_tx, setup_rx) = oneshot::channel();
    let log_path = std::path::PathBuf::from(&run.log_file);
    let metrics_path = orchestrator
        .config
        .logs_dir
        .join(format!("{}_metrics.jsonl", run_id));
    if let Err(e) = orchestrator
        .dal
        .pipeline_run()
        .set_metrics_file(run_id, &metrics_path.to_string_lossy())
        .await
    {
        warn!(run_id = %run_id, error = %e, "Failed to record metrics file path");
    }

    let log_task = match orchestrator.backend.stream_logs(&handle).await {
        Ok(stream) => {
            let dal = orchestrator.dal.clone();
            let options = LogPumpOptions {
                strip_timestamps: matches!(
                    orchestrator.config.executor,
                    crate::config::ExecutorKind::Kubernetes
                ),
                notebook: pipeline.entry_type() == EntryType::Notebook,
                max_size_mb: orchestrator.config.log_max_size_mb,
            };
            let path = log_path.clone();
            Some(tokio::spawn(async move {
                if let Err(e) =
                    streams::pump_logs(stream, &path, log_queue, Some(setup_tx), dal, run_id, options)
                        .await
                {
                    warn!(run_id = %run_id, error = %e, "Log pump failed");
                }
            }))
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Could not attach log stream");
            None
        }
    };

    let metric_task = match orchestrator.backend.stream_metrics(&handle).await {
        Ok(stream) => {
            let limits = effective.limits.clone();
            let path = metrics_path.clone();
            let notifier = Arc::clone(&orchestrator.notifier);
            let run_for_breach = run.clone();
            Some(tokio::spawn(async move {
                let result = streams::pump_metrics(stream, &path, metric_queue, limits, |breach| {
                    let notifier = Arc::clone(&notifier);
                    let run = run_for_breach.clone();
                    tokio::spawn(async move {
                        notifier.soft_limit_exceeded(&run, &breach).await;
                    });
                })
                .await;
                if let Err(e) = result {
                    warn!(run_id = %run_id, error = %e, "Metric pump failed");
                }
            }))
        }
        Err(e) => {
            debug!(run_id = %run_id, error = %e, "Could not attach metric stream");
            None
        }
    };

    // Setup telemetry: uv version probe plus time-to-sentinel
    {
        let orchestrator = orchestrator.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let uv_version = orchestrator.backend.uv_version(&handle).await;
            let setup_duration =
                match tokio::time::timeout(SETUP_READY_TIMEOUT, setup_rx).await {
                    Ok(Ok(())) => Some(submit_started.elapsed().as_secs_f64()),
                    _ => None,
                };
            if let Err(e) = orchestrator
                .dal
                .pipeline_run()
                .set_setup_info(handle.run_id.into(), uv_version, setup_duration)
                .await
            {
                warn!(run_id = %handle.run_id, error = %e, "Failed to record setup info");
            }
        });
    }

    // Wait for termination (the backend kills at the deadline)
    let exit = match orchestrator.backend.wait(&handle, effective.timeout).await {
        Ok(exit) => exit,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Wait failed");
            abort_pumps(log_task, metric_task).await;
            finalize_infrastructure_failure(&orchestrator, &run, &pipeline, e.to_string())
                .await;
            let _ = orchestrator.backend.cleanup(&handle).await;
            return;
        }
    };

    // Drain: the log stream ends when the workload does; give it a moment,
    // then stop whatever is left
    tokio::time::sleep(DRAIN_GRACE).await;
    if let Some(task) = log_task {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            debug!(run_id = %run_id, "Log pump still busy after exit; aborted");
        }
    }
    if let Some(task) = metric_task {
        task.abort();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    recover_late_logs(&orchestrator, &handle, &log_path).await;

    finalize_run(&orchestrator, run, pipeline, effective, handle, exit).await;
}

/// Classifies the exit and walks the full finalisation sequence.
async fn finalize_run(
    orchestrator: &Orchestrator,
    run: PipelineRun,
    pipeline: Arc<DiscoveredPipeline>,
    effective: EffectiveRunSettings,
    handle: WorkloadHandle,
    exit: WorkloadExit,
) {
    let run_id = run.id;
    let success = exit.exit_code == 0 && !exit.oom_killed;
    let oom = is_oom(exit.exit_code, exit.oom_killed);
    let message = classify_exit_code(exit.exit_code, exit.oom_killed);

    let (status, error_type) = if success {
        (RunStatus::Success, None)
    } else {
        (RunStatus::Failed, Some(RunErrorType::PipelineError))
    };

    if !success {
        warn!(
            run_id = %run_id,
            exit_code = exit.exit_code,
            oom,
            message = message.as_deref().unwrap_or(""),
            "Run failed"
        );
    }

    let finalized = finalize_with_retry(
        orchestrator,
        run_id,
        status,
        Some(exit.exit_code),
        error_type,
        message,
    )
    .await;

    // Resource cleanup happens regardless of the status write
    if let Err(e) = orchestrator.backend.cleanup(&handle).await {
        warn!(run_id = %run_id, error = %e, "Workload cleanup failed");
    }
    orchestrator.registry.remove(run_id.0);

    if !finalized {
        // Repeated write failure leaves the row RUNNING; the next zombie
        // reconciliation finalises it
        return;
    }

    let webhook = run.triggered_by.starts_with("webhook");
    if let Err(e) = orchestrator
        .dal
        .pipeline()
        .record_run_outcome(&pipeline.name, success, webhook)
        .await
    {
        error!(run_id = %run_id, error = %e, "Failed to update pipeline stats");
    }

    if success {
        info!(run_id = %run_id, pipeline = %pipeline.name, "Run succeeded");
        trigger_downstream(orchestrator, &pipeline.name, true).await;
        return;
    }

    // Failure path: retries (script pipelines only — notebooks retry per
    // cell inside the run), then on-failure chaining, notifications, and the
    // daemon crash-restart policy
    if pipeline.entry_type() == EntryType::Script && effective.retry_attempts > 0 {
        let current_retry_count = run.retry_count();
        if current_retry_count < effective.retry_attempts {
            let attempt = current_retry_count + 1;
            info!(
                run_id = %run_id,
                pipeline = %pipeline.name,
                attempt,
                max_attempts = effective.retry_attempts,
                "Scheduling retry"
            );
            retry::wait_for_retry(
                attempt,
                effective.retry_strategy.as_ref(),
                orchestrator.config.retry_default_delay,
            )
            .await;

            let mut env = run.env_vars.clone();
            env.insert(RETRY_COUNT_ENV.to_string(), attempt.to_string());
            env.insert(PREVIOUS_RUN_ENV.to_string(), run_id.to_string());
            let triggered_by = if run.triggered_by.ends_with("_retry") {
                run.triggered_by.clone()
            } else {
                format!("{}_retry", run.triggered_by)
            };

            match orchestrator
                .submit(
                    &pipeline.name,
                    SubmitRequest {
                        env,
                        parameters: Default::default(),
                        triggered_by,
                        run_config_id: run.run_config_id.clone(),
                    },
                )
                .await
            {
                // The original stays FAILED; the retry is a new run
                Ok(new_run) => {
                    debug!(run_id = %run_id, retry_run_id = %new_run.id, "Retry submitted");
                    return;
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Retry submission failed");
                }
            }
        }
    }

    trigger_downstream(orchestrator, &pipeline.name, false).await;

    if let Ok(final_run) = orchestrator.dal.pipeline_run().get(run_id).await {
        orchestrator.notifier.run_finished(&final_run).await;
    }

    // Daemon pipelines restart after a cooldown once every retry is spent
    if pipeline.metadata.restart_on_crash {
        let cooldown = pipeline.metadata.restart_cooldown;
        let orchestrator = orchestrator.clone();
        let name = pipeline.name.clone();
        tokio::spawn(async move {
            crate::daemon::schedule_restart_on_crash(orchestrator, name, cooldown).await;
        });
    }
}

/// Submits every resolved downstream pipeline; failures are isolated.
async fn trigger_downstream(orchestrator: &Orchestrator, upstream: &str, on_success: bool) {
    let targets = crate::triggers::resolve_downstream(
        &orchestrator.discovery,
        &orchestrator.dal,
        upstream,
        on_success,
    )
    .await;
    for (downstream, run_config_id) in targets {
        match orchestrator
            .submit(
                &downstream,
                SubmitRequest {
                    env: Default::default(),
                    parameters: Default::default(),
                    triggered_by: "downstream".to_string(),
                    run_config_id,
                },
            )
            .await
        {
            Ok(run) => info!(
                upstream,
                downstream = %downstream,
                run_id = %run.id,
                on_success,
                "Downstream pipeline triggered"
            ),
            Err(e) => warn!(
                upstream,
                downstream = %downstream,
                error = %e,
                "Downstream trigger failed"
            ),
        }
    }
}

/// A submission or wait failure: the workload never produced a usable exit.
async fn finalize_infrastructure_failure(
    orchestrator: &Orchestrator,
    run: &PipelineRun,
    pipeline: &Arc<DiscoveredPipeline>,
    message: String,
) {
    let finalized = finalize_with_retry(
        orchestrator,
        run.id,
        RunStatus::Failed,
        Some(-1),
        Some(RunErrorType::InfrastructureError),
        Some(message),
    )
    .await;
    orchestrator.registry.remove(run.id.0);
    if !finalized {
        return;
    }

    let webhook = run.triggered_by.starts_with("webhook");
    if let Err(e) = orchestrator
        .dal
        .pipeline()
        .record_run_outcome(&pipeline.name, false, webhook)
        .await
    {
        error!(run_id = %run.id, error = %e, "Failed to update pipeline stats");
    }

    // Infrastructure failures are not retried here; the circuit breaker
    // gates the next attempt instead
    trigger_downstream(orchestrator, &pipeline.name, false).await;
    if let Ok(final_run) = orchestrator.dal.pipeline_run().get(run.id).await {
        orchestrator.notifier.run_finished(&final_run).await;
    }
    if pipeline.metadata.restart_on_crash {
        let cooldown = pipeline.metadata.restart_cooldown;
        let orchestrator = orchestrator.clone();
        let name = pipeline.name.clone();
        tokio::spawn(async move {
            crate::daemon::schedule_restart_on_crash(orchestrator, name, cooldown).await;
        });
    }
}

/// Writes the terminal status, retrying briefly on storage errors.
///
/// Returns false when the run was already terminal (lost a race with
/// cancel) or the write never succeeded.
async fn finalize_with_retry(
    orchestrator: &Orchestrator,
    run_id: UniversalUuid,
    status: RunStatus,
    exit_code: Option<i64>,
    error_type: Option<RunErrorType>,
    error_message: Option<String>,
) -> bool {
    for attempt in 1..=FINALIZE_ATTEMPTS {
        match orchestrator
            .dal
            .pipeline_run()
            .finalize(run_id, status, exit_code, error_type, error_message.clone())
            .await
        {
            Ok(updated) => return updated,
            Err(e) if attempt < FINALIZE_ATTEMPTS => {
                warn!(
                    run_id = %run_id,
                    attempt,
                    error = %e,
                    "Finalisation write failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(e) => {
                error!(
                    run_id = %run_id,
                    error = %e,
                    "Finalisation failed; leaving the row for zombie reconciliation"
                );
                return false;
            }
        }
    }
    false
}

async fn abort_pumps(
    log_task: Option<tokio::task::JoinHandle<()>>,
    metric_task: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(task) = log_task {
        task.abort();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
    if let Some(task) = metric_task {
        task.abort();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}

/// Re-reads the container log tail once when the persisted file stayed
/// suspiciously small, so lines raced at shutdown are not lost.
async fn recover_late_logs(
    orchestrator: &Orchestrator,
    handle: &WorkloadHandle,
    log_path: &std::path::Path,
) {
    let size = tokio::fs::metadata(log_path).await.map(|m| m.len()).unwrap_or(0);
    if size >= 100 {
        return;
    }
    let tail = orchestrator.backend.tail_logs(handle).await;
    if tail.is_empty() {
        return;
    }
    let mut content = String::new();
    for line in tail {
        let line = streams::unwrap_json_log_line(&line);
        if line.is_empty() || line.trim() == crate::executor::SETUP_READY_MARKER {
            continue;
        }
        content.push_str(&streams::format_log_line(&line));
        content.push('\n');
    }
    if content.is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::write(log_path, content).await {
        warn!(run_id = %handle.run_id, error = %e, "Failed to write recovered log tail");
    }
}
