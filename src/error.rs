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

//! Error types for the Fast-Flow orchestrator.
//!
//! Each subsystem has its own error enum; the HTTP layer maps these onto
//! response codes. `SubmitError` is the union surfaced by the orchestrator's
//! public submit/cancel operations.

use thiserror::Error;

/// Errors from the data access layer.
///
/// Wraps connection-pool failures and Diesel errors, plus the value-level
/// conversions performed at the DAL boundary (BLOB UUIDs, RFC3339 timestamps).
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Failed to acquire or use a pooled connection
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Entity lookup returned no row
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored UUID bytes could not be decoded
    #[error("Invalid UUID in database: {0}")]
    Uuid(#[from] uuid::Error),

    /// Stored timestamp string could not be parsed
    #[error("Invalid timestamp in database: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// A value was rejected at the boundary (metadata, secret key, schedule spec)
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Errors from the secrets vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No encryption key configured
    #[error("Encryption key is not set (ENCRYPTION_KEY)")]
    MissingKey,

    #[error("Invalid encryption key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext unreadable: tampered, truncated, or wrong key
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid ciphertext: too short")]
    InvalidCiphertext,

    /// Secret key violates the `[A-Za-z0-9_/-]`, no-`..`, 1-255 chars rule
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// Errors from pipeline discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The pipelines root does not exist; fatal at startup
    #[error("Pipelines directory does not exist: {0}")]
    RootMissing(std::path::PathBuf),

    #[error("Pipelines path is not a directory: {0}")]
    NotADirectory(std::path::PathBuf),

    #[error("Pipeline not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata file rewrite (enable/webhook-key) failed
    #[error("Failed to write metadata for pipeline '{pipeline}': {message}")]
    MetadataWrite { pipeline: String, message: String },
}

/// Errors from an execution backend (container runtime or cluster API).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The runtime/cluster API rejected or failed a call
    #[error("Backend API error: {0}")]
    Api(String),

    /// The circuit breaker guarding the backend is open
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by `Orchestrator::submit` and related operations.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Pipeline is disabled: {0}")]
    PipelineDisabled(String),

    /// Global concurrency cap reached
    #[error("Concurrency limit reached ({limit}); wait for a run to finish")]
    ConcurrencyLimit { limit: usize },

    /// Per-pipeline max_instances cap reached
    #[error("Instance limit for pipeline '{pipeline}' reached ({active}/{limit})")]
    PipelineInstanceLimit {
        pipeline: String,
        active: i64,
        limit: i64,
    },

    /// The orchestrator is draining; no new runs are accepted
    #[error("Orchestrator is shutting down; not accepting new runs")]
    ShuttingDown,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Errors from the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cron expression or interval value rejected
    #[error("Invalid trigger: {trigger_type} = {trigger_value}")]
    InvalidTrigger {
        trigger_type: String,
        trigger_value: String,
    },

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Scheduled job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Advisory classification recorded on a failed run.
///
/// The UI distinguishes infrastructure failures (proxy down, cluster API
/// errors, circuit open) from pipeline failures (user code exited non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorType {
    PipelineError,
    InfrastructureError,
}

impl RunErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorType::PipelineError => "pipeline_error",
            RunErrorType::InfrastructureError => "infrastructure_error",
        }
    }
}

impl std::fmt::Display for RunErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
