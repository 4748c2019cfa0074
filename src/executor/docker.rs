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

//! Docker execution backend.
//!
//! Talks to the container runtime exclusively through a hardened socket proxy
//! (`DOCKER_PROXY_URL`); the raw Docker socket is never exposed to this
//! process. Each run becomes one container from the fixed worker image with
//! the pipeline directory mounted read-only at `/app` and the shared uv
//! caches mounted read-write.
//!
//! Host paths for the bind mounts are resolved by inspecting this process's
//! own container mounts (the orchestrator usually runs containerised), with
//! environment hints and the container path itself as fallbacks.
//!
//! All control calls go through the container-runtime circuit breaker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::discovery::EntryType;
use crate::error::BackendError;
use crate::resilience::{CircuitBreaker, CircuitBreakerError};

use super::command::{
    build_command, APP_MOUNT, RUNNER_MOUNT, UV_CACHE_MOUNT, UV_PYTHON_MOUNT,
};
use super::types::{
    cpu_percent, parse_memory_limit, LiveWorkload, MetricSample, WorkloadExit, WorkloadHandle,
    WorkloadSpec, WorkloadState, PIPELINE_LABEL, RUN_ID_LABEL, TIMEOUT_EXIT_CODE,
};
use super::{ExecutionBackend, LogStream, MetricStream};

fn api_error(e: bollard::errors::Error) -> BackendError {
    BackendError::Api(e.to_string())
}

fn breaker_error<E: Into<BackendError>>(e: CircuitBreakerError<E>) -> BackendError {
    match e {
        CircuitBreakerError::Open(message) => BackendError::CircuitOpen(message),
        CircuitBreakerError::Inner(inner) => inner.into(),
    }
}

impl From<bollard::errors::Error> for BackendError {
    fn from(e: bollard::errors::Error) -> Self {
        api_error(e)
    }
}

/// Docker backend over the socket proxy.
pub struct DockerBackend {
    docker: Docker,
    worker_image: String,
    pipelines_dir: std::path::PathBuf,
    uv_cache_dir: std::path::PathBuf,
    uv_python_install_dir: std::path::PathBuf,
    runners_dir: std::path::PathBuf,
    pipelines_host_hint: Option<String>,
    uv_cache_host_hint: Option<String>,
    uv_python_host_hint: Option<String>,
    runners_host_hint: Option<String>,
    metrics_interval: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl DockerBackend {
    /// Connects to the socket proxy, verifies it answers, and ensures the
    /// worker image is present (pulling it when missing).
    pub async fn connect(
        config: &OrchestratorConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, BackendError> {
        // Reject obviously malformed proxy URLs before bollard does
        url::Url::parse(&config.docker_proxy_url)
            .map_err(|e| BackendError::Unavailable(format!("invalid proxy URL: {}", e)))?;

        let docker = Docker::connect_with_http(&config.docker_proxy_url, 30, API_DEFAULT_VERSION)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        docker.ping().await.map_err(|e| {
            BackendError::Unavailable(format!(
                "docker socket proxy is unreachable ({}): {}",
                config.docker_proxy_url, e
            ))
        })?;
        info!(proxy = %config.docker_proxy_url, "Docker socket proxy connection verified");

        let backend = Self {
            docker,
            worker_image: config.worker_image.clone(),
            pipelines_dir: config.pipelines_dir.clone(),
            uv_cache_dir: config.uv_cache_dir.clone(),
            uv_python_install_dir: config.uv_python_install_dir.clone(),
            runners_dir: config.runners_dir.clone(),
            pipelines_host_hint: config.pipelines_host_dir.clone(),
            uv_cache_host_hint: config.uv_cache_host_dir.clone(),
            uv_python_host_hint: config.uv_python_host_dir.clone(),
            runners_host_hint: config.runners_host_dir.clone(),
            metrics_interval: config.metrics_interval(),
            breaker,
        };
        backend.ensure_worker_image().await?;
        Ok(backend)
    }

    async fn ensure_worker_image(&self) -> Result<(), BackendError> {
        if self.docker.inspect_image(&self.worker_image).await.is_ok() {
            info!(image = %self.worker_image, "Worker image present");
            return Ok(());
        }
        info!(image = %self.worker_image, "Worker image missing, pulling");
        let options = CreateImageOptions {
            from_image: self.worker_image.clone(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                BackendError::Unavailable(format!(
                    "failed to pull worker image {}: {}",
                    self.worker_image, e
                ))
            })?;
        info!(image = %self.worker_image, "Worker image pulled");
        Ok(())
    }

    /// Resolves the host path backing a container-internal path.
    ///
    /// Order: this process's own container mounts, any container whose mount
    /// covers the path, the absolute env hint, and finally the container
    /// path itself (local development outside Docker).
    async fn resolve_host_path(&self, container_path: &Path, hint: Option<&str>) -> String {
        let needle = container_path.to_string_lossy().to_string();

        let own_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "fastflow-orchestrator".into());
        if let Ok(inspection) = self.docker.inspect_container(&own_name, None).await {
            if let Some(source) = mount_source(inspection.mounts.as_deref(), &needle) {
                debug!(container_path = %needle, host_path = %source, "Resolved host path from own mounts");
                return source;
            }
        }

        // The orchestrator's container name may differ from HOSTNAME (e.g.
        // running under Kubernetes with a Docker sidecar); scan all containers
        if let Ok(containers) = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
        {
            for summary in containers {
                let Some(id) = summary.id else { continue };
                if let Ok(inspection) = self.docker.inspect_container(&id, None).await {
                    if let Some(source) = mount_source(inspection.mounts.as_deref(), &needle) {
                        debug!(container_path = %needle, host_path = %source, container = %id,
                               "Resolved host path from container mounts");
                        return source;
                    }
                }
            }
        }

        if let Some(hint) = hint {
            if Path::new(hint).is_absolute() {
                debug!(container_path = %needle, host_path = hint, "Using host path hint");
                return hint.to_string();
            }
        }

        warn!(
            container_path = %needle,
            "Could not resolve host path; falling back to the container path \
             (works only for local development outside Docker)"
        );
        std::fs::canonicalize(container_path)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or(needle)
    }

    async fn binds_for(&self, spec: &WorkloadSpec) -> Vec<String> {
        let pipelines_base = self
            .resolve_host_path(&self.pipelines_dir, self.pipelines_host_hint.as_deref())
            .await;
        let pipeline_host = Path::new(&pipelines_base)
            .join(&spec.pipeline_name)
            .to_string_lossy()
            .to_string();
        let uv_cache_host = self
            .resolve_host_path(&self.uv_cache_dir, self.uv_cache_host_hint.as_deref())
            .await;
        let uv_python_host = self
            .resolve_host_path(
                &self.uv_python_install_dir,
                self.uv_python_host_hint.as_deref(),
            )
            .await;

        let mut binds = vec![
            format!("{}:{}:ro", pipeline_host, APP_MOUNT),
            format!("{}:{}:rw", uv_cache_host, UV_CACHE_MOUNT),
            format!("{}:{}:rw", uv_python_host, UV_PYTHON_MOUNT),
        ];

        if spec.entry_type == EntryType::Notebook {
            let runners_host = self
                .resolve_host_path(&self.runners_dir, self.runners_host_hint.as_deref())
                .await;
            // Inside Kubernetes the runner ships in the worker image instead
            // of a host directory; skip the mount when resolution fell back
            // to an in-container path.
            if !runners_host.starts_with(APP_MOUNT) {
                binds.push(format!("{}:{}:ro", runners_host, RUNNER_MOUNT));
            }
        }

        binds
    }
}

fn mount_source(mounts: Option<&[bollard::models::MountPoint]>, container_path: &str) -> Option<String> {
    for mount in mounts? {
        let destination = mount.destination.as_deref()?;
        let covers = destination == container_path
            || container_path.starts_with(&format!("{}/", destination));
        if covers {
            if let Some(source) = mount.source.as_deref() {
                if Path::new(source).is_absolute() {
                    return Some(source.to_string());
                }
            }
        }
    }
    None
}

#[async_trait::async_trait]
impl ExecutionBackend for DockerBackend {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, BackendError> {
        let command = build_command(spec);
        let binds = self.binds_for(spec).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let labels = HashMap::from([
            (RUN_ID_LABEL.to_string(), spec.run_id.to_string()),
            (PIPELINE_LABEL.to_string(), spec.pipeline_name.clone()),
        ]);

        let mut host_config = HostConfig {
            binds: Some(binds),
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some(HashMap::from([
                    ("max-size".to_string(), "10m".to_string()),
                    ("max-file".to_string(), "3".to_string()),
                ])),
            }),
            ..Default::default()
        };
        if let Some(raw) = &spec.limits.mem_hard_limit {
            let bytes = parse_memory_limit(raw)
                .map_err(|e| BackendError::Api(format!("bad mem_hard_limit: {}", e)))?;
            // memswap == memory forbids swap
            host_config.memory = Some(bytes);
            host_config.memory_swap = Some(bytes);
        }
        if let Some(cores) = spec.limits.cpu_hard_limit {
            host_config.nano_cpus = Some((cores * 1e9) as i64);
        }

        let container_config = Config {
            image: Some(self.worker_image.clone()),
            cmd: Some(command),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        info!(
            run_id = %spec.run_id,
            pipeline = %spec.pipeline_name,
            cpu_limit = ?spec.limits.cpu_hard_limit,
            mem_limit = ?spec.limits.mem_hard_limit,
            "Creating container"
        );

        let options = CreateContainerOptions {
            name: format!("fastflow-run-{}", spec.run_id),
            platform: None,
        };

        let docker = self.docker.clone();
        let id = self
            .breaker
            .call(|| async move {
                let created = docker
                    .create_container(Some(options), container_config)
                    .await?;
                docker
                    .start_container(&created.id, None::<StartContainerOptions<String>>)
                    .await?;
                Ok::<_, bollard::errors::Error>(created.id)
            })
            .await
            .map_err(breaker_error)?;

        info!(run_id = %spec.run_id, container = %short_id(&id), "Container started");
        Ok(WorkloadHandle {
            run_id: spec.run_id,
            id,
        })
    }

    async fn stream_logs(&self, handle: &WorkloadHandle) -> Result<LogStream, BackendError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(&handle.id, Some(options))
            .map(|item| match item {
                Ok(output) => Ok(log_output_bytes(output)),
                Err(e) => Err(api_error(e)),
            });
        Ok(stream.boxed())
    }

    async fn stream_metrics(&self, handle: &WorkloadHandle) -> Result<MetricStream, BackendError> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let interval = self.metrics_interval;
        let stream = self
            .docker
            .stats(&handle.id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(stats) => Some(sample_from_stats(&stats)),
                    Err(e) => {
                        debug!(error = %e, "Stats stream ended");
                        None
                    }
                }
            })
            // The daemon emits roughly one frame per second; hold the fixed
            // sampling cadence
            .then(move |sample| async move {
                tokio::time::sleep(interval).await;
                sample
            });
        Ok(stream.boxed())
    }

    async fn wait(
        &self,
        handle: &WorkloadHandle,
        timeout: Option<Duration>,
    ) -> Result<WorkloadExit, BackendError> {
        self.breaker.check().map_err(BackendError::CircuitOpen)?;

        let wait_future = async {
            let mut stream = self
                .docker
                .wait_container(&handle.id, None::<WaitContainerOptions<String>>);
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // bollard reports a non-zero exit as this error variant
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(code)
                }
                Some(Err(e)) => Err(api_error(e)),
                None => Err(BackendError::Api(
                    "wait stream closed without a response".to_string(),
                )),
            }
        };

        let exit_code = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, wait_future).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        run_id = %handle.run_id,
                        timeout_secs = deadline.as_secs(),
                        "Workload deadline reached, killing container"
                    );
                    if let Err(e) = self
                        .docker
                        .kill_container(&handle.id, None::<KillContainerOptions<String>>)
                        .await
                    {
                        warn!(error = %e, "Failed to kill timed-out container");
                    }
                    return Ok(WorkloadExit {
                        exit_code: TIMEOUT_EXIT_CODE,
                        oom_killed: false,
                    });
                }
            },
            None => wait_future.await?,
        };

        // The OOM flag lives on the container state, not the wait response
        let oom_killed = match self.docker.inspect_container(&handle.id, None).await {
            Ok(inspection) => inspection
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!(run_id = %handle.run_id, error = %e, "Failed to check OOMKilled");
                false
            }
        };

        Ok(WorkloadExit {
            exit_code,
            oom_killed,
        })
    }

    async fn cancel(&self, handle: &WorkloadHandle, grace: Duration) -> Result<(), BackendError> {
        let docker = self.docker.clone();
        let id = handle.id.clone();
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.breaker
            .call(|| async move { docker.stop_container(&id, Some(options)).await })
            .await
            .map_err(breaker_error)
    }

    async fn cleanup(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        let docker = self.docker.clone();
        let id = handle.id.clone();
        self.breaker
            .call(|| async move {
                docker
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
            })
            .await
            .map_err(breaker_error)
    }

    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, BackendError> {
        let docker = self.docker.clone();
        let summaries = self
            .breaker
            .call(|| async move {
                docker
                    .list_containers(Some(ListContainersOptions {
                        all: true,
                        filters: HashMap::from([(
                            "label".to_string(),
                            vec![RUN_ID_LABEL.to_string()],
                        )]),
                        ..Default::default()
                    }))
                    .await
            })
            .await
            .map_err(breaker_error)?;

        let mut workloads = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            let labels = summary.labels.unwrap_or_default();
            let Some(run_id) = labels
                .get(RUN_ID_LABEL)
                .and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                warn!(container = %short_id(&id), "Labelled container has an unparsable run id");
                continue;
            };
            let pipeline_name = labels.get(PIPELINE_LABEL).cloned();

            let state = match summary.state.as_deref() {
                Some("running") => WorkloadState::Running,
                Some("exited") | Some("dead") => {
                    match self.docker.inspect_container(&id, None).await {
                        Ok(inspection) => {
                            let state = inspection.state.unwrap_or_default();
                            WorkloadState::Exited {
                                exit_code: state.exit_code.unwrap_or(-1),
                                oom_killed: state.oom_killed.unwrap_or(false),
                            }
                        }
                        Err(_) => WorkloadState::Unknown,
                    }
                }
                _ => WorkloadState::Unknown,
            };

            workloads.push(LiveWorkload {
                run_id,
                pipeline_name,
                handle: WorkloadHandle { run_id, id },
                state,
            });
        }
        Ok(workloads)
    }

    async fn uv_version(&self, handle: &WorkloadHandle) -> Option<String> {
        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(vec!["uv", "--version"]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .ok()?;

        match self.docker.start_exec(&exec.id, None).await.ok()? {
            StartExecResults::Attached { mut output, .. } => {
                let mut collected = String::new();
                while let Some(Ok(chunk)) = output.next().await {
                    collected.push_str(&String::from_utf8_lossy(&log_output_bytes(chunk)));
                }
                let version = collected.trim();
                (!version.is_empty()).then(|| version.to_string())
            }
            StartExecResults::Detached => None,
        }
    }

    async fn tail_logs(&self, handle: &WorkloadHandle) -> Vec<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: "1000".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(&handle.id, Some(options));
        let mut lines = Vec::new();
        let mut buffer = Vec::new();
        while let Some(Ok(output)) = stream.next().await {
            buffer.extend_from_slice(&log_output_bytes(output));
        }
        for line in buffer.split(|b| *b == b'\n') {
            let text = String::from_utf8_lossy(line).trim_end().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }
}

fn log_output_bytes(output: LogOutput) -> Vec<u8> {
    output.into_bytes().to_vec()
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// One metric sample from a Docker stats frame.
///
/// Docker ships the previous frame as `precpu_stats`, so the CPU delta is
/// computed entirely within one frame.
fn sample_from_stats(stats: &Stats) -> MetricSample {
    let container_delta = stats.cpu_stats.cpu_usage.total_usage as i64
        - stats.precpu_stats.cpu_usage.total_usage as i64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as i64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as i64;
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1);

    let cpu = cpu_percent(container_delta, system_delta, online_cpus);

    let ram_mb = stats
        .memory_stats
        .usage
        .map(|bytes| round2(bytes as f64 / (1024.0 * 1024.0)));
    let ram_limit_mb = stats
        .memory_stats
        .limit
        .map(|bytes| round2(bytes as f64 / (1024.0 * 1024.0)));

    MetricSample {
        timestamp: Utc::now(),
        // First frame has no previous sample; report 0 rather than skip
        cpu_percent: Some(cpu.unwrap_or(0.0)),
        ram_mb,
        ram_limit_mb,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
