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

//! Kubernetes Jobs execution backend.
//!
//! One Job per run, `restartPolicy: Never`, `backoffLimit: 0`, and
//! `activeDeadlineSeconds` carrying the effective timeout. The pipeline
//! source is copied into a run-specific subdirectory of a shared
//! ReadWriteMany volume before Job creation; the same PVC provides the uv
//! package and interpreter caches as sub-paths.
//!
//! Logs are read from the pod log stream with server-side timestamps (the
//! line reader downstream strips them, handling chunk boundaries). Metrics
//! come from the optional cluster metrics API on a fixed cadence; when the
//! API is unavailable no sample is emitted — missing is not zero.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::BackendError;
use crate::resilience::{CircuitBreaker, CircuitBreakerError};

use super::command::{build_command, APP_MOUNT, UV_CACHE_MOUNT, UV_PYTHON_MOUNT};
use super::types::{
    LiveWorkload, MetricSample, WorkloadExit, WorkloadHandle, WorkloadSpec, WorkloadState,
    PIPELINE_LABEL, RUN_ID_LABEL, TIMEOUT_EXIT_CODE,
};
use super::{ExecutionBackend, LogStream, MetricStream};

/// How long to wait for a Job's pod to appear and leave Pending.
const POD_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Polling interval for Job completion.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive metrics-API failures before the metric stream gives up.
const METRIC_FAILURE_LIMIT: u32 = 5;

fn kube_error(e: kube::Error) -> BackendError {
    BackendError::Api(e.to_string())
}

fn breaker_error(e: CircuitBreakerError<kube::Error>) -> BackendError {
    match e {
        CircuitBreakerError::Open(message) => BackendError::CircuitOpen(message),
        CircuitBreakerError::Inner(inner) => kube_error(inner),
    }
}

/// Kubernetes Jobs backend.
pub struct KubernetesBackend {
    client: Client,
    namespace: String,
    worker_image: String,
    shared_dir: PathBuf,
    shared_pvc_claim: String,
    metrics_interval: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl KubernetesBackend {
    /// Connects using the in-cluster (or kubeconfig) default client.
    pub async fn connect(
        config: &OrchestratorConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, BackendError> {
        let client = Client::try_default()
            .await
            .map_err(|e| BackendError::Unavailable(format!("kubernetes client: {}", e)))?;
        info!(namespace = %config.kubernetes_namespace, "Kubernetes client initialized");
        Ok(Self {
            client,
            namespace: config.kubernetes_namespace.clone(),
            worker_image: config.worker_image.clone(),
            shared_dir: config.shared_dir.clone(),
            shared_pvc_claim: config.shared_pvc_claim.clone(),
            metrics_interval: config.metrics_interval(),
            breaker,
        })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Run-specific directory on the shared volume holding the copied source.
    fn run_source_dir(&self, run_id: Uuid) -> PathBuf {
        self.shared_dir.join("pipeline_runs").join(run_id.to_string())
    }

    /// Finds the pod backing a Job.
    async fn find_pod(&self, job_name: &str) -> Result<Option<Pod>, BackendError> {
        let params = ListParams::default().labels(&format!("job-name={}", job_name));
        let pods = self.pods().list(&params).await.map_err(kube_error)?;
        Ok(pods.items.into_iter().next())
    }

    /// Waits for the Job's pod to exist and leave Pending, returning its name.
    async fn wait_for_pod(&self, job_name: &str) -> Result<String, BackendError> {
        let deadline = tokio::time::Instant::now() + POD_STARTUP_TIMEOUT;
        loop {
            if let Some(pod) = self.find_pod(job_name).await? {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("Pending");
                if phase != "Pending" && phase != "Unknown" {
                    if let Some(name) = pod.metadata.name {
                        return Ok(name);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::Api(format!(
                    "pod for job {} did not start within {:?}",
                    job_name, POD_STARTUP_TIMEOUT
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn build_job(&self, spec: &WorkloadSpec, job_name: &str) -> Job {
        let labels = BTreeMap::from([
            (RUN_ID_LABEL.to_string(), spec.run_id.to_string()),
            (PIPELINE_LABEL.to_string(), spec.pipeline_name.clone()),
        ]);

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            })
            .collect();

        let mut limits = BTreeMap::new();
        if let Some(cores) = spec.limits.cpu_hard_limit {
            limits.insert("cpu".to_string(), Quantity(format!("{}", cores)));
        }
        if let Some(raw) = &spec.limits.mem_hard_limit {
            limits.insert("memory".to_string(), Quantity(memory_to_quantity(raw)));
        }
        let resources = (!limits.is_empty()).then(|| ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        });

        let volume_mounts = vec![
            VolumeMount {
                name: "shared".to_string(),
                mount_path: APP_MOUNT.to_string(),
                sub_path: Some(format!("pipeline_runs/{}", spec.run_id)),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "shared".to_string(),
                mount_path: UV_CACHE_MOUNT.to_string(),
                sub_path: Some("uv_cache".to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: "shared".to_string(),
                mount_path: UV_PYTHON_MOUNT.to_string(),
                sub_path: Some("uv_python".to_string()),
                ..Default::default()
            },
        ];

        let volumes = vec![Volume {
            name: "shared".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.shared_pvc_claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        }];

        let active_deadline_seconds = spec
            .timeout
            .filter(|t| !t.is_zero())
            .map(|t| t.as_secs() as i64);

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                active_deadline_seconds,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "pipeline".to_string(),
                            image: Some(self.worker_image.clone()),
                            command: Some(build_command(spec)),
                            env: Some(env),
                            resources,
                            volume_mounts: Some(volume_mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Terminal state of a Job, if it has one.
    async fn job_exit(&self, job_name: &str) -> Result<Option<WorkloadExit>, BackendError> {
        let job = match self.jobs().get_opt(job_name).await.map_err(kube_error)? {
            Some(job) => job,
            None => return Ok(None),
        };
        let Some(status) = job.status else {
            return Ok(None);
        };

        if status.succeeded.unwrap_or(0) > 0 {
            return Ok(Some(WorkloadExit {
                exit_code: 0,
                oom_killed: false,
            }));
        }
        if status.failed.unwrap_or(0) > 0 {
            // The active deadline surfaces as a DeadlineExceeded condition
            let deadline_exceeded = status
                .conditions
                .unwrap_or_default()
                .iter()
                .any(|c| c.reason.as_deref() == Some("DeadlineExceeded"));
            if deadline_exceeded {
                return Ok(Some(WorkloadExit {
                    exit_code: TIMEOUT_EXIT_CODE,
                    oom_killed: false,
                }));
            }
            return Ok(Some(self.pod_exit(job_name).await));
        }
        Ok(None)
    }

    /// Exit details from the pod's terminated container state.
    async fn pod_exit(&self, job_name: &str) -> WorkloadExit {
        let pod = match self.find_pod(job_name).await {
            Ok(Some(pod)) => pod,
            _ => {
                return WorkloadExit {
                    exit_code: -1,
                    oom_killed: false,
                }
            }
        };
        let terminated = pod
            .status
            .and_then(|s| s.container_statuses)
            .and_then(|statuses| statuses.into_iter().next())
            .and_then(|status| status.state)
            .and_then(|state| state.terminated);
        match terminated {
            Some(terminated) => WorkloadExit {
                exit_code: terminated.exit_code as i64,
                oom_killed: terminated.reason.as_deref() == Some("OOMKilled")
                    || terminated.exit_code == 137,
            },
            None => WorkloadExit {
                exit_code: -1,
                oom_killed: false,
            },
        }
    }

}

#[async_trait::async_trait]
impl ExecutionBackend for KubernetesBackend {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, BackendError> {
        // Copy the pipeline source into the run's shared-volume directory so
        // the Job sees an immutable snapshot
        let target = self.run_source_dir(spec.run_id);
        copy_dir_recursive(&spec.pipeline_path, &target)?;

        let job_name = format!("fastflow-run-{}", spec.run_id);
        let job = self.build_job(spec, &job_name);

        info!(
            run_id = %spec.run_id,
            pipeline = %spec.pipeline_name,
            job = %job_name,
            "Creating Job"
        );

        let jobs = self.jobs();
        self.breaker
            .call(|| async move { jobs.create(&PostParams::default(), &job).await })
            .await
            .map_err(breaker_error)?;

        Ok(WorkloadHandle {
            run_id: spec.run_id,
            id: job_name,
        })
    }

    async fn stream_logs(&self, handle: &WorkloadHandle) -> Result<LogStream, BackendError> {
        let pod_name = self.wait_for_pod(&handle.id).await?;
        let params = LogParams {
            follow: true,
            // Server-side timestamps give every line a stable prefix the
            // reader strips after re-framing
            timestamps: true,
            ..Default::default()
        };
        let reader = self
            .pods()
            .log_stream(&pod_name, &params)
            .await
            .map_err(kube_error)?;
        let stream = reader
            .lines()
            .map(|line| match line {
                Ok(mut line) => {
                    line.push('\n');
                    Ok(line.into_bytes())
                }
                Err(e) => Err(BackendError::Io(e)),
            });
        Ok(stream.boxed())
    }

    async fn stream_metrics(&self, handle: &WorkloadHandle) -> Result<MetricStream, BackendError> {
        let pod_name = self.wait_for_pod(&handle.id).await?;
        let backend = KubernetesBackendHandle {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
        };
        let interval = self.metrics_interval;

        let stream = futures::stream::unfold(
            (backend, pod_name, 0u32, true),
            move |(backend, pod_name, mut failures, mut first)| async move {
                loop {
                    if !first {
                        tokio::time::sleep(interval).await;
                    }
                    first = false;
                    match KubernetesBackend::metrics_probe(&backend, &pod_name).await {
                        Ok(sample) => {
                            return Some((sample, (backend, pod_name, 0, false)));
                        }
                        Err(e) => {
                            failures += 1;
                            if failures >= METRIC_FAILURE_LIMIT {
                                // The metrics API is optional; missing data
                                // is reported as no samples, never as zeros
                                debug!(error = %e, "Metrics API unavailable; ending metric stream");
                                return None;
                            }
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn wait(
        &self,
        handle: &WorkloadHandle,
        timeout: Option<Duration>,
    ) -> Result<WorkloadExit, BackendError> {
        self.breaker.check().map_err(BackendError::CircuitOpen)?;
        let started = tokio::time::Instant::now();
        loop {
            if let Some(exit) = self.job_exit(&handle.id).await? {
                return Ok(exit);
            }
            // activeDeadlineSeconds enforces the timeout in-cluster; this is
            // the belt-and-braces check for a wedged Job controller
            if let Some(deadline) = timeout {
                if !deadline.is_zero() && started.elapsed() > deadline + Duration::from_secs(30) {
                    warn!(job = %handle.id, "Job exceeded deadline without terminating; deleting");
                    let _ = self.cancel(handle, Duration::from_secs(0)).await;
                    return Ok(WorkloadExit {
                        exit_code: TIMEOUT_EXIT_CODE,
                        oom_killed: false,
                    });
                }
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    async fn cancel(&self, handle: &WorkloadHandle, grace: Duration) -> Result<(), BackendError> {
        let jobs = self.jobs();
        let name = handle.id.clone();
        let params = DeleteParams {
            grace_period_seconds: Some(grace.as_secs() as u32),
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.breaker
            .call(|| async move { jobs.delete(&name, &params).await })
            .await
            .map_err(breaker_error)?;
        Ok(())
    }

    async fn cleanup(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        let jobs = self.jobs();
        let name = handle.id.clone();
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        let result = self
            .breaker
            .call(|| async move { jobs.delete(&name, &params).await })
            .await;
        match result {
            Ok(_) => {}
            // Already gone is success for cleanup
            Err(CircuitBreakerError::Inner(kube::Error::Api(response)))
                if response.code == 404 => {}
            Err(e) => return Err(breaker_error(e)),
        }

        let source_dir = self.run_source_dir(handle.run_id);
        if source_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&source_dir) {
                warn!(path = %source_dir.display(), error = %e, "Failed to remove run source copy");
            }
        }
        Ok(())
    }

    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, BackendError> {
        let jobs = self.jobs();
        let params = ListParams::default().labels(RUN_ID_LABEL);
        let listed = self
            .breaker
            .call(|| async move { jobs.list(&params).await })
            .await
            .map_err(breaker_error)?;

        let mut workloads = Vec::new();
        for job in listed.items {
            let labels = job.metadata.labels.clone().unwrap_or_default();
            let Some(run_id) = labels
                .get(RUN_ID_LABEL)
                .and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                continue;
            };
            let Some(job_name) = job.metadata.name.clone() else {
                continue;
            };
            let pipeline_name = labels.get(PIPELINE_LABEL).cloned();

            let state = match &job.status {
                Some(status) if status.succeeded.unwrap_or(0) > 0 => WorkloadState::Exited {
                    exit_code: 0,
                    oom_killed: false,
                },
                Some(status) if status.failed.unwrap_or(0) > 0 => {
                    let exit = self.pod_exit(&job_name).await;
                    WorkloadState::Exited {
                        exit_code: exit.exit_code,
                        oom_killed: exit.oom_killed,
                    }
                }
                Some(status) if status.active.unwrap_or(0) > 0 => WorkloadState::Running,
                _ => WorkloadState::Unknown,
            };

            workloads.push(LiveWorkload {
                run_id,
                pipeline_name,
                handle: WorkloadHandle {
                    run_id,
                    id: job_name,
                },
                state,
            });
        }
        Ok(workloads)
    }

    async fn uv_version(&self, _handle: &WorkloadHandle) -> Option<String> {
        // No exec surface through the Job API; the worker image pins uv
        Some(format!("image {}", self.worker_image))
    }
}

/// Clonable subset used inside the metric stream's unfold state.
struct KubernetesBackendHandle {
    client: Client,
    namespace: String,
}

impl KubernetesBackend {
    async fn metrics_probe(
        handle: &KubernetesBackendHandle,
        pod_name: &str,
    ) -> Result<MetricSample, BackendError> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            handle.namespace, pod_name
        );
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| BackendError::Api(e.to_string()))?;
        let value: serde_json::Value =
            handle.client.request(request).await.map_err(kube_error)?;

        let mut cpu_cores = 0.0f64;
        let mut memory_mb = 0.0f64;
        let mut observed = false;
        if let Some(containers) = value.get("containers").and_then(|c| c.as_array()) {
            for container in containers {
                let usage = container.get("usage");
                if let Some(raw) = usage.and_then(|u| u.get("cpu")).and_then(|v| v.as_str()) {
                    cpu_cores += parse_cpu_quantity(raw);
                    observed = true;
                }
                if let Some(raw) = usage.and_then(|u| u.get("memory")).and_then(|v| v.as_str()) {
                    memory_mb += parse_memory_quantity_mb(raw);
                    observed = true;
                }
            }
        }
        if !observed {
            return Err(BackendError::Api("metrics response had no usage".to_string()));
        }
        Ok(MetricSample {
            timestamp: Utc::now(),
            // CPU in cores maps onto the 0-100 scale of one core
            cpu_percent: Some((cpu_cores * 100.0).clamp(0.0, 100.0)),
            ram_mb: Some((memory_mb * 100.0).round() / 100.0),
            ram_limit_mb: None,
        })
    }
}

/// Converts "512m"/"2g"/"1024k" to the Kubernetes quantity spelling.
fn memory_to_quantity(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase();
    if let Some(digits) = normalized.strip_suffix('g') {
        return format!("{}Gi", digits);
    }
    if let Some(digits) = normalized.strip_suffix('m') {
        return format!("{}Mi", digits);
    }
    if let Some(digits) = normalized.strip_suffix('k') {
        return format!("{}Ki", digits);
    }
    normalized
}

/// Parses a CPU usage quantity ("250m", "1", "12345678n") into cores.
fn parse_cpu_quantity(raw: &str) -> f64 {
    let re = Regex::new(r"^([0-9]+)(n|u|m)?$").expect("static regex");
    let Some(captures) = re.captures(raw.trim()) else {
        return raw.trim().parse().unwrap_or(0.0);
    };
    let value: f64 = captures[1].parse().unwrap_or(0.0);
    match captures.get(2).map(|m| m.as_str()) {
        Some("n") => value / 1e9,
        Some("u") => value / 1e6,
        Some("m") => value / 1e3,
        _ => value,
    }
}

/// Parses a memory usage quantity ("123456Ki", "512Mi", "1Gi") into MB.
fn parse_memory_quantity_mb(raw: &str) -> f64 {
    let re = Regex::new(r"^([0-9]+)(Ki|Mi|Gi)?$").expect("static regex");
    let Some(captures) = re.captures(raw.trim()) else {
        return 0.0;
    };
    let value: f64 = captures[1].parse().unwrap_or(0.0);
    match captures.get(2).map(|m| m.as_str()) {
        Some("Ki") => value / 1024.0,
        Some("Mi") => value,
        Some("Gi") => value * 1024.0,
        _ => value / (1024.0 * 1024.0),
    }
}

/// Copies a pipeline directory tree into the shared volume.
fn copy_dir_recursive(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let destination = target.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &destination)?;
        } else {
            std::fs::copy(&path, &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_to_quantity() {
        assert_eq!(memory_to_quantity("512m"), "512Mi");
        assert_eq!(memory_to_quantity("2G"), "2Gi");
        assert_eq!(memory_to_quantity("64k"), "64Ki");
        assert_eq!(memory_to_quantity("1048576"), "1048576");
    }

    #[test]
    fn test_parse_cpu_quantity() {
        assert_eq!(parse_cpu_quantity("250m"), 0.25);
        assert_eq!(parse_cpu_quantity("1"), 1.0);
        assert!((parse_cpu_quantity("1500000000n") - 1.5).abs() < 1e-9);
        assert_eq!(parse_cpu_quantity("junk"), 0.0);
    }

    #[test]
    fn test_parse_memory_quantity_mb() {
        assert_eq!(parse_memory_quantity_mb("512Mi"), 512.0);
        assert_eq!(parse_memory_quantity_mb("1Gi"), 1024.0);
        assert_eq!(parse_memory_quantity_mb("2048Ki"), 2.0);
    }

    #[test]
    fn test_copy_dir_recursive() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("main.py"), "print('hi')").unwrap();
        std::fs::create_dir(source.path().join("lib")).unwrap();
        std::fs::write(source.path().join("lib/util.py"), "x = 1").unwrap();

        let target = tempfile::tempdir().unwrap();
        let destination = target.path().join("copy");
        copy_dir_recursive(source.path(), &destination).unwrap();

        assert!(destination.join("main.py").is_file());
        assert!(destination.join("lib/util.py").is_file());
    }
}
