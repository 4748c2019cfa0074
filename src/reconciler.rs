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

//! Zombie reconciliation (crash recovery).
//!
//! At startup, every workload labelled by this system is compared with the
//! run registry:
//!
//! - no database row → the workload is removed;
//! - workload still running, row not RUNNING → the row is marked RUNNING and
//!   the log/metric streams re-attach;
//! - workload terminated, row still RUNNING → the run is finalised from the
//!   workload state (exit code, OOMKilled), stats update, the workload is
//!   removed.
//!
//! Rows already terminal never transition back: a terminal row with a live
//!   workload means a cancel raced the crash, so the workload is stopped.

use std::time::Duration;

use tracing::{info, warn};

use crate::database::universal_types::UniversalUuid;
use crate::error::{BackendError, RunErrorType, ValidationError};
use crate::executor::types::{classify_exit_code, is_oom};
use crate::executor::{LiveWorkload, WorkloadState};
use crate::models::RunStatus;
use crate::orchestrator::streams::{self, LogPumpOptions};
use crate::orchestrator::Orchestrator;

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub orphans_removed: usize,
    pub reattached: usize,
    pub finalized: usize,
}

/// Runs one reconciliation pass over all labelled workloads.
pub async fn reconcile_zombies(
    orchestrator: &Orchestrator,
) -> Result<ReconcileSummary, BackendError> {
    let workloads = orchestrator.backend.list_live_workloads().await?;
    let mut summary = ReconcileSummary {
        checked: workloads.len(),
        ..Default::default()
    };

    for workload in workloads {
        let run_id = UniversalUuid(workload.run_id);
        let run = match orchestrator.dal.pipeline_run().get(run_id).await {
            Ok(run) => Some(run),
            Err(ValidationError::NotFound(_)) => None,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Reconciliation lookup failed");
                continue;
            }
        };

        match (run, workload.state) {
            (None, _) => {
                warn!(
                    run_id = %run_id,
                    workload = %workload.handle.id,
                    "Orphaned workload with no run row; removing"
                );
                if let Err(e) = orchestrator.backend.cleanup(&workload.handle).await {
                    warn!(run_id = %run_id, error = %e, "Failed to remove orphaned workload");
                } else {
                    summary.orphans_removed += 1;
                }
            }
            (Some(run), WorkloadState::Running) => {
                if run.status.is_terminal() {
                    // Cancelled while the control plane was down; stop it
                    info!(run_id = %run_id, "Terminal run with a live workload; stopping");
                    let _ = orchestrator
                        .backend
                        .cancel(&workload.handle, Duration::from_secs(10))
                        .await;
                    let _ = orchestrator.backend.cleanup(&workload.handle).await;
                    continue;
                }
                info!(run_id = %run_id, "Re-attaching to live workload");
                if run.status != RunStatus::Running {
                    if let Err(e) = orchestrator.dal.pipeline_run().force_running(run_id).await {
                        warn!(run_id = %run_id, error = %e, "Failed to mark re-attached run RUNNING");
                    }
                }
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    reattach(orchestrator, workload).await;
                });
                summary.reattached += 1;
            }
            (Some(run), WorkloadState::Exited { exit_code, oom_killed }) => {
                if run.status != RunStatus::Running && run.status != RunStatus::Pending {
                    // Finalised already; the resource is cruft
                    let _ = orchestrator.backend.cleanup(&workload.handle).await;
                    continue;
                }
                info!(
                    run_id = %run_id,
                    exit_code,
                    oom_killed,
                    "Finalising orphaned run from workload state"
                );
                finalize_from_state(orchestrator, &run.pipeline_name, run_id, exit_code, oom_killed)
                    .await;
                let _ = orchestrator.backend.cleanup(&workload.handle).await;
                summary.finalized += 1;
            }
            (Some(_), WorkloadState::Unknown) => {
                warn!(run_id = %run_id, "Workload state unknown; leaving for the next pass");
            }
        }
    }

    info!(
        checked = summary.checked,
        orphans_removed = summary.orphans_removed,
        reattached = summary.reattached,
        finalized = summary.finalized,
        "Zombie reconciliation complete"
    );
    Ok(summary)
}

/// Finalises a run from observed workload state and updates stats.
async fn finalize_from_state(
    orchestrator: &Orchestrator,
    pipeline_name: &str,
    run_id: UniversalUuid,
    exit_code: i64,
    oom_killed: bool,
) {
    let success = exit_code == 0 && !is_oom(exit_code, oom_killed);
    let status = if success {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };
    let error_type = (!success).then_some(RunErrorType::PipelineError);
    let message = classify_exit_code(exit_code, oom_killed);

    match orchestrator
        .dal
        .pipeline_run()
        .finalize(run_id, status, Some(exit_code), error_type, message)
        .await
    {
        Ok(true) => {
            if let Err(e) = orchestrator
                .dal
                .pipeline()
                .record_run_outcome(pipeline_name, success, false)
                .await
            {
                warn!(run_id = %run_id, error = %e, "Failed to update stats during reconciliation");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to finalise reconciled run"),
    }
}

/// Re-attaches the streams to a surviving workload and sees it to the end.
///
/// Simpler than a full lifecycle: no pre-heat, no retry, no downstream
/// chaining — the original submission's policies died with the old process;
/// what matters is that logs keep flowing and the run finalises.
async fn reattach(orchestrator: Orchestrator, workload: LiveWorkload) {
    let run_id = UniversalUuid(workload.run_id);
    let run = match orchestrator.dal.pipeline_run().get(run_id).await {
        Ok(run) => run,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Re-attach lost its run row");
            return;
        }
    };

    let pipeline_name = workload
        .pipeline_name
        .clone()
        .unwrap_or_else(|| run.pipeline_name.clone());
    let _ = orchestrator.registry.admit(workload.run_id, &pipeline_name);
    orchestrator
        .registry
        .set_handle(workload.run_id, workload.handle.clone());

    let notebook = orchestrator
        .discovery
        .get(&pipeline_name)
        .ok()
        .flatten()
        .map(|p| p.entry_type() == crate::discovery::EntryType::Notebook)
        .unwrap_or(false);

    let log_task = match orchestrator.backend.stream_logs(&workload.handle).await {
        Ok(stream) => {
            let queue = orchestrator
                .registry
                .log_sender(workload.run_id)
                .unwrap_or_else(|| tokio::sync::broadcast::channel(1).0);
            let dal = orchestrator.dal.clone();
            let options = LogPumpOptions {
                strip_timestamps: matches!(
                    orchestrator.config.executor,
                    crate::config::ExecutorKind::Kubernetes
                ),
                notebook,
                max_size_mb: orchestrator.config.log_max_size_mb,
            };
            let path = std::path::PathBuf::from(&run.log_file);
            Some(tokio::spawn(async move {
                let _ = streams::pump_logs(stream, &path, queue, None, dal, run_id, options).await;
            }))
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Re-attach could not open the log stream");
            None
        }
    };

    let exit = match orchestrator.backend.wait(&workload.handle, None).await {
        Ok(exit) => exit,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Re-attach wait failed");
            orchestrator.registry.remove(workload.run_id);
            return;
        }
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Some(task) = log_task {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            // Pump aborted with the task handle drop
        }
    }

    finalize_from_state(
        &orchestrator,
        &pipeline_name,
        run_id,
        exit.exit_code,
        exit.oom_killed,
    )
    .await;
    let _ = orchestrator.backend.cleanup(&workload.handle).await;
    orchestrator.registry.remove(workload.run_id);
}
