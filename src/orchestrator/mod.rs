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

//! The run lifecycle orchestrator.
//!
//! Sequences pre-heat → submit → stream → wait → finalise → stats →
//! downstream → retry for every run, owns the live-run registry, enforces
//! global and per-pipeline concurrency limits, and exposes the log/metric
//! fan-out queues the HTTP SSE handlers consume.
//!
//! Exceptions inside a single run never propagate to others: each lifecycle
//! runs in its own task and reports through the run row.

pub mod cell_protocol;
mod lifecycle;
pub mod registry;
pub mod streams;

pub use registry::{AdmissionError, RunRegistry};
pub use streams::SoftLimitBreach;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dal::DAL;
use crate::database::universal_types::UniversalUuid;
use crate::discovery::{DiscoveredPipeline, PipelineDiscovery, ScheduleOverride};
use crate::error::{SubmitError, ValidationError};
use crate::executor::{command, ExecutionBackend, ResourceLimits};
use crate::models::{NewPipelineRun, PipelineRun, RunStatus};
use crate::preheat::Preheater;
use crate::resilience::Breakers;
use crate::retry::RetryStrategy;
use crate::vault::SecretsVault;

/// Env key carrying the retry ordinal on a retried run.
pub const RETRY_COUNT_ENV: &str = "_fastflow_retry_count";

/// Env key pointing a retried run at its predecessor.
pub const PREVIOUS_RUN_ENV: &str = "_fastflow_previous_run_id";

/// Outbound notification port (external collaborator). Default is a no-op.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A run reached a terminal failure or interruption.
    async fn run_finished(&self, run: &PipelineRun);

    /// A soft resource limit was exceeded (at most once per run).
    async fn soft_limit_exceeded(&self, run: &PipelineRun, breach: &SoftLimitBreach);
}

/// Notifier that drops everything (no channels configured).
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn run_finished(&self, _run: &PipelineRun) {}
    async fn soft_limit_exceeded(&self, _run: &PipelineRun, _breach: &SoftLimitBreach) {}
}

/// A submission request from the HTTP layer, scheduler, or chaining.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub env: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub triggered_by: String,
    pub run_config_id: Option<String>,
}

/// Health report for a live run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunHealth {
    pub healthy: bool,
    pub reason: Option<String>,
}

/// Settings for one run after applying any named-schedule override.
#[derive(Debug, Clone)]
pub(crate) struct EffectiveRunSettings {
    pub limits: ResourceLimits,
    /// None = unbounded daemon
    pub timeout: Option<Duration>,
    pub retry_attempts: u32,
    pub retry_strategy: Option<RetryStrategy>,
}

/// The orchestrator.
///
/// Cheap to clone: every field is a handle. Spawned lifecycle tasks own a
/// clone, so a run never borrows from the caller.
pub struct Orchestrator {
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) dal: DAL,
    pub(crate) discovery: Arc<PipelineDiscovery>,
    pub(crate) vault: SecretsVault,
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    pub(crate) registry: Arc<RunRegistry>,
    pub(crate) preheater: Arc<Preheater>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) breakers: Breakers,
    shutting_down: Arc<AtomicBool>,
}

impl Clone for Orchestrator {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            dal: self.dal.clone(),
            discovery: Arc::clone(&self.discovery),
            vault: self.vault.clone(),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            preheater: Arc::clone(&self.preheater),
            notifier: Arc::clone(&self.notifier),
            breakers: self.breakers.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        dal: DAL,
        discovery: Arc<PipelineDiscovery>,
        vault: SecretsVault,
        backend: Arc<dyn ExecutionBackend>,
        preheater: Arc<Preheater>,
        notifier: Arc<dyn Notifier>,
        breakers: Breakers,
    ) -> Self {
        let registry = Arc::new(RunRegistry::new(
            config.max_concurrent_runs,
            config.stream_queue_capacity,
        ));
        Self {
            config: Arc::new(config),
            dal,
            discovery,
            vault,
            backend,
            registry,
            preheater,
            notifier,
            breakers,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dal(&self) -> &DAL {
        &self.dal
    }

    pub fn discovery(&self) -> &Arc<PipelineDiscovery> {
        &self.discovery
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Submits a run for a pipeline.
    ///
    /// Validates existence and enabledness, applies admission control
    /// (global cap counts live entries; the per-pipeline cap counts pending
    /// and running rows), resolves the environment, creates the `PENDING`
    /// row, and spawns the lifecycle task. Returns the created run.
    pub fn submit<'a>(
        &'a self,
        name: &'a str,
        request: SubmitRequest,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<PipelineRun, SubmitError>> + Send + 'a>,
    > {
        Box::pin(self.submit_inner(name, request))
    }

    async fn submit_inner(
        &self,
        name: &str,
        request: SubmitRequest,
    ) -> Result<PipelineRun, SubmitError> {
        if self.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }

        let pipeline = self
            .discovery
            .get(name)?
            .ok_or_else(|| SubmitError::PipelineNotFound(name.to_string()))?;
        if !pipeline.is_enabled() {
            return Err(SubmitError::PipelineDisabled(name.to_string()));
        }

        if let Some(limit) = pipeline.metadata.max_instances {
            let active = self.dal.pipeline_run().count_active(name).await?;
            if active >= limit as i64 {
                return Err(SubmitError::PipelineInstanceLimit {
                    pipeline: name.to_string(),
                    active,
                    limit: limit as i64,
                });
            }
        }

        // Reserve the registry slot before the row exists so bursts cannot
        // overshoot the global cap while workloads are still launching
        let run_id = UniversalUuid::new_v4();
        self.registry
            .admit(run_id.0, name)
            .map_err(|AdmissionError::ConcurrencyLimit { limit }| {
                SubmitError::ConcurrencyLimit { limit }
            })?;

        let schedule = request
            .run_config_id
            .as_deref()
            .and_then(|id| pipeline.metadata.schedule(id).cloned());
        let env = self.resolve_env(&pipeline, schedule.as_ref(), &request).await;
        let effective = effective_settings(&self.config, &pipeline, schedule.as_ref());

        let log_file = self
            .config
            .logs_dir
            .join(format!("{}_{}.log", name, Utc::now().format("%Y-%m-%dT%H-%M-%S%.6fZ")))
            .to_string_lossy()
            .to_string();

        let triggered_by = if request.triggered_by.is_empty() {
            "manual".to_string()
        } else {
            request.triggered_by.clone()
        };

        let created = self
            .dal
            .pipeline_run()
            .create_with_id(
                run_id,
                NewPipelineRun {
                    pipeline_name: name.to_string(),
                    log_file,
                    env_vars: env.clone(),
                    parameters: request.parameters.clone(),
                    triggered_by,
                    run_config_id: request.run_config_id.clone(),
                },
            )
            .await;
        let run = match created {
            Ok(run) => run,
            Err(e) => {
                self.registry.remove(run_id.0);
                return Err(e.into());
            }
        };

        info!(
            run_id = %run.id,
            pipeline = %name,
            triggered_by = %run.triggered_by,
            "Run submitted"
        );

        let orchestrator = self.clone();
        let run_for_task = run.clone();
        tokio::spawn(async move {
            lifecycle::run_lifecycle(orchestrator, run_for_task, pipeline, effective).await;
        });

        Ok(run)
    }

    /// Cancels a pending or running run.
    ///
    /// Stops the workload with a short grace period, marks the row
    /// `INTERRUPTED`, and fires notifications. A cancel on a terminal run is
    /// a no-op returning false.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, ValidationError> {
        let id = UniversalUuid(run_id);
        let run = match self.dal.pipeline_run().get(id).await {
            Ok(run) => run,
            Err(ValidationError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if run.status.is_terminal() {
            return Ok(false);
        }

        if let Some(handle) = self.registry.handle(run_id) {
            let grace = Duration::from_secs(self.config.cancel_grace_seconds);
            if let Err(e) = self.backend.cancel(&handle, grace).await {
                warn!(run_id = %run_id, error = %e, "Failed to stop workload during cancel");
            }
        }

        let finalized = self
            .dal
            .pipeline_run()
            .finalize(id, RunStatus::Interrupted, None, None, None)
            .await?;
        if finalized {
            self.dal
                .pipeline()
                .record_run_interrupted(&run.pipeline_name)
                .await?;
            if let Ok(updated) = self.dal.pipeline_run().get(id).await {
                self.notifier.run_finished(&updated).await;
            }
        }
        // The lifecycle task observes the terminal row and cleans up; a
        // pending run with no task-side workload is released here
        if self.registry.handle(run_id).is_none() {
            self.registry.remove(run_id);
        }
        Ok(true)
    }

    /// Health-checks a live run's workload.
    pub async fn check_run_health(&self, run_id: Uuid) -> RunHealth {
        let Some(_handle) = self.registry.handle(run_id) else {
            return RunHealth {
                healthy: false,
                reason: Some("workload not found (already finished?)".to_string()),
            };
        };
        match self.backend.list_live_workloads().await {
            Ok(workloads) => match workloads.iter().find(|w| w.run_id == run_id) {
                Some(w) if w.state == crate::executor::WorkloadState::Running => RunHealth {
                    healthy: true,
                    reason: None,
                },
                Some(w) => RunHealth {
                    healthy: false,
                    reason: Some(format!("workload state: {:?}", w.state)),
                },
                None => RunHealth {
                    healthy: false,
                    reason: Some("workload missing from the backend".to_string()),
                },
            },
            Err(e) => RunHealth {
                healthy: false,
                reason: Some(format!("backend error: {}", e)),
            },
        }
    }

    /// SSE subscription to a live run's log lines.
    pub fn subscribe_logs(&self, run_id: Uuid) -> Option<broadcast::Receiver<String>> {
        self.registry.subscribe_logs(run_id)
    }

    /// SSE subscription to a live run's metric samples.
    pub fn subscribe_metrics(&self, run_id: Uuid) -> Option<broadcast::Receiver<String>> {
        self.registry.subscribe_metrics(run_id)
    }

    /// Graceful shutdown: stop accepting runs, stop live workloads with a
    /// generous grace period, mark their rows `INTERRUPTED`, flush breakers.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Graceful shutdown: stopping live runs");

        let running = match self.dal.pipeline_run().list_running().await {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "Failed to list running runs during shutdown");
                Vec::new()
            }
        };

        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        for run in running {
            let status = match self.registry.handle(run.id.0) {
                Some(handle) => match self.backend.cancel(&handle, grace).await {
                    Ok(()) => RunStatus::Interrupted,
                    Err(e) => {
                        warn!(run_id = %run.id, error = %e, "Failed to stop workload during shutdown");
                        RunStatus::Warning
                    }
                },
                None => RunStatus::Warning,
            };
            if let Err(e) = self
                .dal
                .pipeline_run()
                .finalize(run.id, status, None, None, None)
                .await
            {
                error!(run_id = %run.id, error = %e, "Failed to finalize run during shutdown");
                continue;
            }
            let _ = self
                .dal
                .pipeline()
                .record_run_interrupted(&run.pipeline_name)
                .await;
        }

        self.breakers.reset_all();
        info!("Graceful shutdown complete");
    }

    /// Resolves the merged environment for a run; later sources win:
    /// pipeline default_env → schedule default_env → pipeline encrypted_env →
    /// schedule encrypted_env → global secrets → caller env → caller
    /// parameters → fixed base env.
    async fn resolve_env(
        &self,
        pipeline: &DiscoveredPipeline,
        schedule: Option<&ScheduleOverride>,
        request: &SubmitRequest,
    ) -> HashMap<String, String> {
        let mut env = pipeline.metadata.default_env.clone();
        if let Some(schedule) = schedule {
            env.extend(schedule.default_env.clone());
        }

        for (key, ciphertext) in &pipeline.metadata.encrypted_env {
            match self.vault.decrypt(ciphertext) {
                Ok(value) => {
                    env.insert(key.clone(), value);
                }
                Err(e) => warn!(
                    pipeline = %pipeline.name,
                    key = %key,
                    error = %e,
                    "Skipping undecryptable encrypted_env entry"
                ),
            }
        }
        if let Some(schedule) = schedule {
            for (key, ciphertext) in &schedule.encrypted_env {
                match self.vault.decrypt(ciphertext) {
                    Ok(value) => {
                        env.insert(key.clone(), value);
                    }
                    Err(e) => warn!(
                        pipeline = %pipeline.name,
                        key = %key,
                        error = %e,
                        "Skipping undecryptable schedule encrypted_env entry"
                    ),
                }
            }
        }

        match self.vault.get_all(&self.dal).await {
            Ok(secrets) => env.extend(secrets),
            Err(e) => warn!(error = %e, "Failed to load stored secrets for run env"),
        }

        env.extend(request.env.clone());
        env.extend(request.parameters.clone());
        env.extend(command::base_env());
        env
    }
}

/// Applies the named-schedule override on top of pipeline metadata and the
/// global default timeout. `0` at any layer means unbounded.
pub(crate) fn effective_settings(
    config: &OrchestratorConfig,
    pipeline: &DiscoveredPipeline,
    schedule: Option<&ScheduleOverride>,
) -> EffectiveRunSettings {
    let meta = &pipeline.metadata;
    let pick_f64 = |s: Option<f64>, p: Option<f64>| s.or(p);
    let pick_str =
        |s: Option<&String>, p: Option<&String>| s.cloned().or_else(|| p.cloned());

    let limits = ResourceLimits {
        cpu_hard_limit: pick_f64(
            schedule.and_then(|s| s.cpu_hard_limit),
            meta.cpu_hard_limit,
        ),
        mem_hard_limit: pick_str(
            schedule.and_then(|s| s.mem_hard_limit.as_ref()),
            meta.mem_hard_limit.as_ref(),
        ),
        cpu_soft_limit: pick_f64(
            schedule.and_then(|s| s.cpu_soft_limit),
            meta.cpu_soft_limit,
        ),
        mem_soft_limit: pick_str(
            schedule.and_then(|s| s.mem_soft_limit.as_ref()),
            meta.mem_soft_limit.as_ref(),
        ),
    };

    let raw_timeout = schedule
        .and_then(|s| s.timeout)
        .or(meta.timeout)
        .or(config.container_timeout);
    let timeout = raw_timeout
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs);

    let retry_attempts = schedule
        .and_then(|s| s.retry_attempts)
        .or(meta.retry_attempts)
        .unwrap_or(config.retry_attempts);
    let retry_strategy = schedule
        .and_then(|s| s.retry_strategy.clone())
        .or_else(|| meta.retry_strategy.clone());

    EffectiveRunSettings {
        limits,
        timeout,
        retry_attempts,
        retry_strategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{EntryType, PipelineMetadata};
    use std::path::PathBuf;

    fn pipeline_with(meta: PipelineMetadata) -> DiscoveredPipeline {
        DiscoveredPipeline {
            name: "p".to_string(),
            path: PathBuf::from("/pipelines/p"),
            has_requirements: false,
            metadata: meta,
        }
    }

    #[test]
    fn test_effective_timeout_resolution() {
        let mut config = OrchestratorConfig::default();
        config.container_timeout = Some(300);

        // Metadata wins over the global default
        let mut meta = PipelineMetadata::default();
        meta.timeout = Some(60);
        let effective = effective_settings(&config, &pipeline_with(meta), None);
        assert_eq!(effective.timeout, Some(Duration::from_secs(60)));

        // timeout 0 means unbounded, even with a global default
        let mut meta = PipelineMetadata::default();
        meta.timeout = Some(0);
        let effective = effective_settings(&config, &pipeline_with(meta), None);
        assert_eq!(effective.timeout, None);

        // Nothing set falls back to the global default
        let effective =
            effective_settings(&config, &pipeline_with(PipelineMetadata::default()), None);
        assert_eq!(effective.timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_schedule_override_wins() {
        let config = OrchestratorConfig::default();
        let mut meta = PipelineMetadata::default();
        meta.cpu_hard_limit = Some(1.0);
        meta.mem_hard_limit = Some("512m".to_string());
        meta.timeout = Some(120);
        meta.retry_attempts = Some(1);

        let schedule = ScheduleOverride {
            id: "prod".to_string(),
            cpu_hard_limit: Some(2.0),
            mem_hard_limit: None,
            cpu_soft_limit: None,
            mem_soft_limit: None,
            timeout: Some(600),
            retry_attempts: Some(3),
            retry_strategy: None,
            default_env: Default::default(),
            encrypted_env: Default::default(),
        };

        let effective = effective_settings(&config, &pipeline_with(meta), Some(&schedule));
        assert_eq!(effective.limits.cpu_hard_limit, Some(2.0));
        // Unset override fields fall through to the pipeline value
        assert_eq!(effective.limits.mem_hard_limit.as_deref(), Some("512m"));
        assert_eq!(effective.timeout, Some(Duration::from_secs(600)));
        assert_eq!(effective.retry_attempts, 3);
    }

    #[test]
    fn test_entry_type_files() {
        assert_eq!(EntryType::Script.entry_file(), "main.py");
        assert_eq!(EntryType::Notebook.entry_file(), "main.ipynb");
    }
}
