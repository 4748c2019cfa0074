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

//! Execution backends.
//!
//! One contract, two implementations: Docker containers launched through a
//! hardened socket proxy, and Kubernetes Jobs. The orchestrator only sees
//! `ExecutionBackend`; tests substitute a fake.

pub mod command;
pub mod types;

#[cfg(feature = "docker")]
pub mod docker;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;

pub use types::{
    classify_exit_code, cpu_percent, is_oom, memory_limit_mb, parse_memory_limit, LiveWorkload,
    MetricSample, ResourceLimits, WorkloadExit, WorkloadHandle, WorkloadSpec, WorkloadState,
    PIPELINE_LABEL, RUN_ID_LABEL, SETUP_READY_MARKER, TIMEOUT_EXIT_CODE,
};

#[cfg(feature = "docker")]
pub use docker::DockerBackend;
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubernetesBackend;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;

/// Raw log chunks from a workload; line framing happens downstream.
pub type LogStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

/// Periodic resource samples for a workload.
pub type MetricStream = BoxStream<'static, MetricSample>;

/// The contract both backends satisfy.
///
/// Submitting launches the workload; the log and metric streams attach to it;
/// `wait` resolves once it terminates (killing it first on timeout); and
/// `cleanup` removes the finished resource. `list_live_workloads` exists for
/// zombie reconciliation only.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Launches a workload and returns its handle. The workload carries the
    /// `fastflow-run-id` and `fastflow-pipeline` labels.
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, BackendError>;

    /// Attaches to the workload's combined stdout/stderr as a byte stream.
    async fn stream_logs(&self, handle: &WorkloadHandle) -> Result<LogStream, BackendError>;

    /// Streams resource samples on a fixed cadence until the workload exits.
    async fn stream_metrics(&self, handle: &WorkloadHandle) -> Result<MetricStream, BackendError>;

    /// Waits for termination. With a timeout, the workload is killed at the
    /// deadline and the exit is reported as `TIMEOUT_EXIT_CODE`.
    async fn wait(
        &self,
        handle: &WorkloadHandle,
        timeout: Option<Duration>,
    ) -> Result<WorkloadExit, BackendError>;

    /// Stops the workload with a grace period (cancellation).
    async fn cancel(&self, handle: &WorkloadHandle, grace: Duration) -> Result<(), BackendError>;

    /// Removes the workload resource after finalisation.
    async fn cleanup(&self, handle: &WorkloadHandle) -> Result<(), BackendError>;

    /// Enumerates all workloads labelled by this system, live or exited.
    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, BackendError>;

    /// Best-effort uv version probe inside the workload, for run telemetry.
    async fn uv_version(&self, _handle: &WorkloadHandle) -> Option<String> {
        None
    }

    /// Best-effort re-read of the final log tail after exit, for lines raced
    /// at shutdown. Backends without the capability return empty.
    async fn tail_logs(&self, _handle: &WorkloadHandle) -> Vec<String> {
        Vec::new()
    }
}
