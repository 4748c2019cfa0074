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

//! Daemon (long-running) pipeline support.
//!
//! A daemon pipeline declares `timeout: 0` with a restart policy:
//! `restart_on_crash` schedules a one-shot delayed resubmission after a
//! failed terminal status, and `restart_interval` drives a recurring
//! scheduler job that cancels the running daemon and submits a fresh run.
//!
//! Both paths re-validate the pipeline before submitting: a pipeline
//! disabled (or its flag lowered) in the interim is left alone.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, SubmitRequest};

/// Sleeps the cooldown, re-checks the policy, and resubmits the pipeline.
/// Called by the lifecycle when a daemon run fails with no retries left.
pub async fn schedule_restart_on_crash(
    orchestrator: Orchestrator,
    pipeline_name: String,
    restart_cooldown: u64,
) {
    info!(
        pipeline = %pipeline_name,
        cooldown_secs = restart_cooldown,
        "Daemon restart scheduled (restart_on_crash)"
    );
    tokio::time::sleep(Duration::from_secs(restart_cooldown)).await;

    let pipeline = match orchestrator.discovery().get(&pipeline_name) {
        Ok(Some(pipeline)) => pipeline,
        Ok(None) => {
            warn!(pipeline = %pipeline_name, "Pipeline gone; daemon restart abandoned");
            return;
        }
        Err(e) => {
            warn!(pipeline = %pipeline_name, error = %e, "Discovery failed; daemon restart abandoned");
            return;
        }
    };
    if !pipeline.is_enabled() {
        info!(pipeline = %pipeline_name, "Pipeline disabled; daemon restart skipped");
        return;
    }
    if !pipeline.metadata.restart_on_crash {
        debug!(pipeline = %pipeline_name, "restart_on_crash lowered; daemon restart skipped");
        return;
    }

    submit_daemon_restart(&orchestrator, &pipeline_name).await;
}

/// Recurring daemon restart: cancel the currently running daemon (if any),
/// wait the cooldown, submit a fresh run. Fired by the scheduler for
/// `restart_interval` jobs.
pub async fn perform_daemon_restart(orchestrator: Orchestrator, pipeline_name: String) {
    let pipeline = match orchestrator.discovery().get(&pipeline_name) {
        Ok(Some(pipeline)) => pipeline,
        Ok(None) => {
            warn!(pipeline = %pipeline_name, "Pipeline gone; daemon restart abandoned");
            return;
        }
        Err(e) => {
            warn!(pipeline = %pipeline_name, error = %e, "Discovery failed; daemon restart abandoned");
            return;
        }
    };
    if !pipeline.is_enabled() {
        info!(pipeline = %pipeline_name, "Pipeline disabled; daemon restart skipped");
        return;
    }
    let cooldown = pipeline.metadata.restart_cooldown;

    match orchestrator.dal().pipeline_run().find_running(&pipeline_name).await {
        Ok(Some(run)) => {
            info!(
                pipeline = %pipeline_name,
                run_id = %run.id,
                "Daemon restart: cancelling the running daemon"
            );
            if let Err(e) = orchestrator.cancel(run.id.0).await {
                warn!(pipeline = %pipeline_name, error = %e, "Daemon cancel failed");
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(pipeline = %pipeline_name, error = %e, "Could not look up the running daemon");
        }
    }

    tokio::time::sleep(Duration::from_secs(cooldown)).await;
    submit_daemon_restart(&orchestrator, &pipeline_name).await;
}

async fn submit_daemon_restart(orchestrator: &Orchestrator, pipeline_name: &str) {
    match orchestrator
        .submit(
            pipeline_name,
            SubmitRequest {
                triggered_by: "daemon_restart".to_string(),
                ..Default::default()
            },
        )
        .await
    {
        Ok(run) => info!(pipeline = %pipeline_name, run_id = %run.id, "Daemon restarted"),
        Err(e) => warn!(pipeline = %pipeline_name, error = %e, "Daemon restart submission failed"),
    }
}
