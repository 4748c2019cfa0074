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

//! Runtime configuration for the orchestrator.
//!
//! All parameters are loaded from environment variables (with a `.env` file
//! honoured via dotenvy), falling back to defaults suitable for local
//! development. The `OrchestratorSettings` database row can override a subset
//! of these at runtime; see the settings DAL.

use std::path::PathBuf;
use std::time::Duration;

/// Which execution backend launches workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Docker containers via a hardened socket proxy
    Docker,
    /// Kubernetes Jobs
    Kubernetes,
}

/// Orchestrator configuration, loaded once at startup.
///
/// # Example
///
/// ```rust,ignore
/// let config = OrchestratorConfig::from_env();
/// assert!(config.max_concurrent_runs > 0);
/// ```
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path of the SQLite database file
    pub database_path: String,
    /// Root directory scanned for pipelines
    pub pipelines_dir: PathBuf,
    /// Directory holding per-run log and metrics files
    pub logs_dir: PathBuf,
    /// Data directory (database, caches)
    pub data_dir: PathBuf,
    /// Shared uv package cache, mounted into every worker
    pub uv_cache_dir: PathBuf,
    /// Shared uv interpreter cache, mounted into every worker
    pub uv_python_install_dir: PathBuf,
    /// Directory holding the in-container notebook runner
    pub runners_dir: PathBuf,

    /// Worker base image (a uv image; never built by the orchestrator)
    pub worker_image: String,
    /// Selected execution backend
    pub executor: ExecutorKind,
    /// Docker socket proxy URL (the raw socket is never exposed)
    pub docker_proxy_url: String,
    /// Kubernetes namespace for Jobs
    pub kubernetes_namespace: String,
    /// ReadWriteMany volume mount inside the orchestrator (Kubernetes backend)
    pub shared_dir: PathBuf,
    /// PVC claim name backing the shared volume
    pub shared_pvc_claim: String,

    /// Host-path hints for volume mounts, used when self-inspection fails
    pub pipelines_host_dir: Option<String>,
    pub uv_cache_host_dir: Option<String>,
    pub uv_python_host_dir: Option<String>,
    pub runners_host_dir: Option<String>,

    /// Global cap on concurrent runs
    pub max_concurrent_runs: usize,
    /// Default kill deadline in seconds; None = unbounded
    pub container_timeout: Option<u64>,
    /// Default retry attempts when metadata does not set any
    pub retry_attempts: u32,
    /// Default retry delay in seconds when no strategy is configured
    pub retry_default_delay: u64,
    /// Interpreter version used when metadata omits python_version
    pub default_python_version: String,
    /// Whether the dependency pre-heater runs before submission
    pub uv_pre_heat: bool,

    /// Keep at most this many runs per pipeline (None = unlimited)
    pub log_retention_runs: Option<u32>,
    /// Delete runs older than this many days (None = keep forever)
    pub log_retention_days: Option<u32>,
    /// Stop persisting a run's log beyond this size (None = unlimited)
    pub log_max_size_mb: Option<u64>,
    /// Seconds between cleanup job passes
    pub cleanup_interval_seconds: u64,

    /// Capacity of each per-run log/metric fan-out queue
    pub stream_queue_capacity: usize,
    /// Discovery cache TTL in seconds (0 disables the TTL)
    pub pipeline_cache_ttl_seconds: u64,

    /// Base64-encoded 32-byte AES key for the secrets vault
    pub encryption_key: Option<String>,
    /// "production" makes a missing encryption key fatal
    pub environment: String,

    /// Grace period for user-initiated cancellation
    pub cancel_grace_seconds: u64,
    /// Grace period per workload during shutdown
    pub shutdown_grace_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/fastflow.db".to_string(),
            pipelines_dir: PathBuf::from("./pipelines"),
            logs_dir: PathBuf::from("./logs"),
            data_dir: PathBuf::from("./data"),
            uv_cache_dir: PathBuf::from("./data/uv_cache"),
            uv_python_install_dir: PathBuf::from("./data/uv_python"),
            runners_dir: PathBuf::from("./runners"),
            worker_image: "ghcr.io/astral-sh/uv:python3.11-bookworm-slim".to_string(),
            executor: ExecutorKind::Docker,
            docker_proxy_url: "http://docker-proxy:2375".to_string(),
            kubernetes_namespace: "fastflow".to_string(),
            shared_dir: PathBuf::from("/shared"),
            shared_pvc_claim: "fastflow-shared".to_string(),
            pipelines_host_dir: None,
            uv_cache_host_dir: None,
            uv_python_host_dir: None,
            runners_host_dir: None,
            max_concurrent_runs: 10,
            container_timeout: None,
            retry_attempts: 0,
            retry_default_delay: 60,
            default_python_version: "3.11".to_string(),
            uv_pre_heat: true,
            log_retention_runs: None,
            log_retention_days: None,
            log_max_size_mb: None,
            cleanup_interval_seconds: 3600,
            stream_queue_capacity: 256,
            pipeline_cache_ttl_seconds: 30,
            encryption_key: None,
            environment: "production".to_string(),
            cancel_grace_seconds: 10,
            shutdown_grace_seconds: 30,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the environment.
    ///
    /// A `.env` file in the working directory is honoured. Unset variables
    /// fall back to the defaults; malformed numeric values also fall back
    /// (with a warning) rather than aborting startup.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let executor = match env_str("PIPELINE_EXECUTOR").as_deref() {
            Some("kubernetes") => ExecutorKind::Kubernetes,
            _ => ExecutorKind::Docker,
        };

        Self {
            database_path: env_str("DATABASE_PATH").unwrap_or(defaults.database_path),
            pipelines_dir: env_path("PIPELINES_DIR").unwrap_or(defaults.pipelines_dir),
            logs_dir: env_path("LOGS_DIR").unwrap_or(defaults.logs_dir),
            data_dir: env_path("DATA_DIR").unwrap_or(defaults.data_dir),
            uv_cache_dir: env_path("UV_CACHE_DIR").unwrap_or(defaults.uv_cache_dir),
            uv_python_install_dir: env_path("UV_PYTHON_INSTALL_DIR")
                .unwrap_or(defaults.uv_python_install_dir),
            runners_dir: env_path("RUNNERS_DIR").unwrap_or(defaults.runners_dir),
            worker_image: env_str("WORKER_BASE_IMAGE").unwrap_or(defaults.worker_image),
            executor,
            docker_proxy_url: env_str("DOCKER_PROXY_URL").unwrap_or(defaults.docker_proxy_url),
            kubernetes_namespace: env_str("KUBERNETES_NAMESPACE")
                .unwrap_or(defaults.kubernetes_namespace),
            shared_dir: env_path("SHARED_DIR").unwrap_or(defaults.shared_dir),
            shared_pvc_claim: env_str("SHARED_PVC_CLAIM").unwrap_or(defaults.shared_pvc_claim),
            pipelines_host_dir: env_str("PIPELINES_HOST_DIR"),
            uv_cache_host_dir: env_str("UV_CACHE_HOST_DIR"),
            uv_python_host_dir: env_str("UV_PYTHON_INSTALL_HOST_DIR"),
            runners_host_dir: env_str("RUNNERS_HOST_DIR"),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS")
                .unwrap_or(defaults.max_concurrent_runs),
            container_timeout: env_parse("CONTAINER_TIMEOUT"),
            retry_attempts: env_parse("RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_default_delay: env_parse("RETRY_DEFAULT_DELAY")
                .unwrap_or(defaults.retry_default_delay),
            default_python_version: env_str("DEFAULT_PYTHON_VERSION")
                .unwrap_or(defaults.default_python_version),
            uv_pre_heat: env_str("UV_PRE_HEAT")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.uv_pre_heat),
            log_retention_runs: env_parse("LOG_RETENTION_RUNS"),
            log_retention_days: env_parse("LOG_RETENTION_DAYS"),
            log_max_size_mb: env_parse("LOG_MAX_SIZE_MB"),
            cleanup_interval_seconds: env_parse("CLEANUP_INTERVAL_SECONDS")
                .unwrap_or(defaults.cleanup_interval_seconds),
            stream_queue_capacity: env_parse("STREAM_QUEUE_CAPACITY")
                .unwrap_or(defaults.stream_queue_capacity),
            pipeline_cache_ttl_seconds: env_parse("PIPELINE_CACHE_TTL_SECONDS")
                .unwrap_or(defaults.pipeline_cache_ttl_seconds),
            encryption_key: env_str("ENCRYPTION_KEY"),
            environment: env_str("FASTFLOW_ENV").unwrap_or(defaults.environment),
            cancel_grace_seconds: env_parse("CANCEL_GRACE_SECONDS")
                .unwrap_or(defaults.cancel_grace_seconds),
            shutdown_grace_seconds: env_parse("SHUTDOWN_GRACE_SECONDS")
                .unwrap_or(defaults.shutdown_grace_seconds),
        }
    }

    /// Creates the directories the orchestrator writes to.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.pipelines_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.uv_cache_dir)?;
        std::fs::create_dir_all(&self.uv_python_install_dir)?;
        Ok(())
    }

    /// True outside production; relaxes the missing-encryption-key check.
    pub fn is_development(&self) -> bool {
        self.environment != "production"
    }

    /// Interval between metric samples; fixed on both backends.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(2)
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_str(key).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring malformed value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_runs, 10);
        assert_eq!(config.retry_attempts, 0);
        assert!(config.container_timeout.is_none());
        assert!(config.uv_pre_heat);
        assert_eq!(config.executor, ExecutorKind::Docker);
        assert!(!config.is_development());
    }

    #[test]
    fn test_metrics_interval_fixed() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.metrics_interval(), Duration::from_secs(2));
    }
}
