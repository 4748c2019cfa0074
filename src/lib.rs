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

//! Fast-Flow: a self-hosted orchestrator that runs Python pipelines as
//! isolated containers.
//!
//! Workloads launch either as Docker containers through a hardened socket
//! proxy or as Kubernetes Jobs. The crate pairs the execution core
//! (lifecycle orchestration, resource enforcement, log and metric streaming,
//! cancellation, crash recovery, chaining, retries) with its directly
//! coupled subsystems: pipeline discovery, the dependency pre-heater, the
//! secrets vault, the persistent scheduler, and the resilience layer.
//!
//! # Architecture
//!
//! - [`discovery`] scans the pipelines root and normalises `pipeline.json`.
//! - [`preheat`] materialises Python environments in the shared uv cache so
//!   a run never resolves dependencies on the hot path.
//! - [`executor`] defines the `ExecutionBackend` contract with Docker and
//!   Kubernetes implementations.
//! - [`orchestrator`] owns the live-run registry and sequences every run:
//!   pre-heat → submit → stream → wait → finalise → stats → downstream →
//!   retry.
//! - [`scheduler`] fires persistent cron/interval/once jobs and daemon
//!   restarts.
//! - [`reconciler`] and [`cleanup`] recover from crashes and enforce log
//!   retention.
//! - [`resilience`] wraps every external dependency in circuit breakers and
//!   bounded retries.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fastflow::prelude::*;
//!
//! let config = OrchestratorConfig::from_env();
//! config.ensure_directories()?;
//!
//! let database = Database::new(&config.database_path);
//! database.run_migrations().await?;
//! let dal = DAL::new(database);
//!
//! let breakers = Breakers::default();
//! let backend: Arc<dyn ExecutionBackend> = Arc::new(
//!     DockerBackend::connect(&config, breakers.container_runtime.clone()).await?,
//! );
//! let discovery = Arc::new(PipelineDiscovery::new(
//!     config.pipelines_dir.clone(),
//!     std::time::Duration::from_secs(config.pipeline_cache_ttl_seconds),
//! ));
//! let vault = SecretsVault::from_config(&config)?;
//! let preheater = Arc::new(Preheater::new(&config, dal.clone()));
//!
//! let orchestrator = Orchestrator::new(
//!     config, dal, discovery, vault, backend, preheater,
//!     Arc::new(NoopNotifier), breakers,
//! );
//!
//! reconciler::reconcile_zombies(&orchestrator).await?;
//! let scheduler = Arc::new(PipelineScheduler::new(orchestrator.clone()));
//! scheduler.clone().start().await;
//!
//! let run = orchestrator.submit("hello", SubmitRequest::default()).await?;
//! ```

pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod dal;
pub mod database;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod preheat;
pub mod reconciler;
pub mod resilience;
pub mod retry;
pub mod scheduler;
pub mod triggers;
pub mod vault;

pub use config::{ExecutorKind, OrchestratorConfig};
pub use dal::DAL;
pub use database::Database;
pub use error::{
    BackendError, DiscoveryError, RunErrorType, SchedulerError, SubmitError, ValidationError,
    VaultError,
};
pub use orchestrator::{NoopNotifier, Notifier, Orchestrator, SubmitRequest};
pub use scheduler::PipelineScheduler;
pub use vault::SecretsVault;

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::cleanup::{BackupError, CleanupJob, LogBackup, NoopLogBackup};
    pub use crate::config::{ExecutorKind, OrchestratorConfig};
    pub use crate::dal::DAL;
    pub use crate::database::Database;
    pub use crate::discovery::{DiscoveredPipeline, PipelineDiscovery, PipelineMetadata};
    pub use crate::executor::ExecutionBackend;
    #[cfg(feature = "docker")]
    pub use crate::executor::DockerBackend;
    #[cfg(feature = "kubernetes")]
    pub use crate::executor::KubernetesBackend;
    pub use crate::models::{PipelineRun, RunStatus, ScheduledJob, TriggerType};
    pub use crate::orchestrator::{NoopNotifier, Notifier, Orchestrator, SubmitRequest};
    pub use crate::preheat::Preheater;
    pub use crate::reconciler;
    pub use crate::resilience::Breakers;
    pub use crate::scheduler::PipelineScheduler;
    pub use crate::vault::SecretsVault;
}

use tracing_subscriber::EnvFilter;

/// Initializes tracing with an env-filter.
///
/// The filter defaults to `info` and honours `RUST_LOG`; pass an explicit
/// directive string to override both.
pub fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
