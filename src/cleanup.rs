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

//! Log retention and resource cleanup.
//!
//! A recurring job that enforces retention by count (keep the N most recent
//! runs per pipeline), by age (delete runs older than D days), and by size
//! (truncate oversized log files). Before any local deletion the log-backup
//! callback is offered the files; only runs it confirms uploaded are
//! deleted. The upload goes through the object-storage circuit breaker with
//! bounded retries, and a failed upload holds every candidate back for the
//! next pass. Separately, labelled workload resources with no RUNNING run
//! row are removed.
//!
//! Values in the `OrchestratorSettings` row override the environment
//! defaults for every pass.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::WorkloadState;
use crate::models::{PipelineRun, RunStatus};
use crate::orchestrator::Orchestrator;
use crate::resilience::{retry_with_backoff, BackoffPolicy};

/// Files offered to the backup callback before deletion.
#[derive(Debug, Clone)]
pub struct BackupItem {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub log_path: Option<PathBuf>,
    pub metrics_path: Option<PathBuf>,
}

/// Upload failure reported by a log-backup implementation.
#[derive(Debug, thiserror::Error)]
#[error("log backup failed: {0}")]
pub struct BackupError(pub String);

/// Log backup port (external collaborator): on run finalised, offer
/// logs+metrics for upload; delete locally only on success.
#[async_trait]
pub trait LogBackup: Send + Sync {
    /// Returns the run ids whose files were uploaded (or need no upload).
    /// An `Err` means the store was unreachable; the caller retries later.
    async fn backup(&self, items: &[BackupItem]) -> Result<Vec<Uuid>, BackupError>;
}

/// Default backup when no object store is configured: everything may be
/// deleted locally.
pub struct NoopLogBackup;

#[async_trait]
impl LogBackup for NoopLogBackup {
    async fn backup(&self, items: &[BackupItem]) -> Result<Vec<Uuid>, BackupError> {
        Ok(items.iter().map(|item| item.run_id).collect())
    }
}

/// What one cleanup pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupSummary {
    pub runs_deleted: usize,
    pub files_truncated: usize,
    pub resources_removed: usize,
}

/// The recurring cleanup job.
pub struct CleanupJob {
    orchestrator: Orchestrator,
    backup: Arc<dyn LogBackup>,
}

impl CleanupJob {
    pub fn new(orchestrator: Orchestrator, backup: Arc<dyn LogBackup>) -> Self {
        Self {
            orchestrator,
            backup,
        }
    }

    /// Spawns the recurring loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.orchestrator.config.cleanup_interval_seconds.max(60));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match self.run_once().await {
                    Ok(summary) => debug!(
                        runs_deleted = summary.runs_deleted,
                        files_truncated = summary.files_truncated,
                        resources_removed = summary.resources_removed,
                        "Cleanup pass complete"
                    ),
                    Err(e) => warn!(error = %e, "Cleanup pass failed"),
                }
            }
        })
    }

    /// One cleanup pass.
    pub async fn run_once(&self) -> Result<CleanupSummary, crate::error::ValidationError> {
        let mut summary = CleanupSummary::default();
        let dal = &self.orchestrator.dal;
        let config = &self.orchestrator.config;

        // Runtime settings override the environment defaults
        let settings = dal.settings().get().await.ok().flatten();
        let retention_runs = settings
            .as_ref()
            .and_then(|s| s.log_retention_runs)
            .map(|v| v as i64)
            .or(config.log_retention_runs.map(|v| v as i64));
        let retention_days = settings
            .as_ref()
            .and_then(|s| s.log_retention_days)
            .map(|v| v as i64)
            .or(config.log_retention_days.map(|v| v as i64));
        let max_size_mb = settings
            .as_ref()
            .and_then(|s| s.log_max_size_mb)
            .map(|v| v as u64)
            .or(config.log_max_size_mb);

        // Collect deletion candidates: beyond the per-pipeline keep count,
        // and older than the age cutoff
        let mut candidates: HashMap<Uuid, PipelineRun> = HashMap::new();
        if let Some(keep) = retention_runs {
            for pipeline in dal.pipeline_run().pipeline_names().await? {
                for run in dal
                    .pipeline_run()
                    .terminal_runs_beyond(&pipeline, keep)
                    .await?
                {
                    candidates.insert(run.id.0, run);
                }
            }
        }
        if let Some(days) = retention_days {
            let cutoff = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();
            for run in dal.pipeline_run().terminal_runs_started_before(&cutoff).await? {
                candidates.insert(run.id.0, run);
            }
        }

        if !candidates.is_empty() {
            let items: Vec<BackupItem> = candidates
                .values()
                .map(|run| BackupItem {
                    run_id: run.id.0,
                    pipeline_name: run.pipeline_name.clone(),
                    log_path: existing_path(&run.log_file),
                    metrics_path: run.metrics_file.as_deref().and_then(existing_path),
                })
                .collect();

            // Delete locally only what the callback confirms uploaded; the
            // store is an external dependency, so the call runs through the
            // object-storage breaker with bounded retries
            let upload = self
                .orchestrator
                .breakers
                .object_storage
                .call(|| {
                    retry_with_backoff("log backup upload", BackoffPolicy::default(), || {
                        self.backup.backup(&items)
                    })
                })
                .await;
            let uploaded = match upload {
                Ok(uploaded) => uploaded,
                Err(e) => {
                    warn!(error = %e, "Log backup unavailable; keeping files for the next pass");
                    Vec::new()
                }
            };
            for run_id in uploaded {
                let Some(run) = candidates.remove(&run_id) else {
                    continue;
                };
                if let Some(path) = existing_path(&run.log_file) {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(run_id = %run_id, error = %e, "Failed to delete log file");
                    }
                }
                if let Some(path) = run.metrics_file.as_deref().and_then(existing_path) {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(run_id = %run_id, error = %e, "Failed to delete metrics file");
                    }
                }
                dal.pipeline_run().delete(run.id).await?;
                summary.runs_deleted += 1;
            }
            if !candidates.is_empty() {
                debug!(
                    held_back = candidates.len(),
                    "Runs kept locally pending backup confirmation"
                );
            }
        }

        // Size retention: truncate any oversized log file in place
        if let Some(cap_mb) = max_size_mb {
            summary.files_truncated = truncate_oversized_logs(&config.logs_dir, cap_mb).await;
        }

        // Remove finished labelled resources with no RUNNING row
        summary.resources_removed = self.remove_crufty_resources().await;

        info!(
            runs_deleted = summary.runs_deleted,
            files_truncated = summary.files_truncated,
            resources_removed = summary.resources_removed,
            "Cleanup finished"
        );
        Ok(summary)
    }

    async fn remove_crufty_resources(&self) -> usize {
        let workloads = match self.orchestrator.backend.list_live_workloads().await {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!(error = %e, "Could not list workloads for cleanup");
                return 0;
            }
        };
        let mut removed = 0;
        for workload in workloads {
            if workload.state == WorkloadState::Running {
                continue;
            }
            let run_id = crate::database::universal_types::UniversalUuid(workload.run_id);
            let keep = match self.orchestrator.dal.pipeline_run().get(run_id).await {
                Ok(run) => run.status == RunStatus::Running || run.status == RunStatus::Pending,
                Err(_) => false,
            };
            if keep {
                continue;
            }
            match self.orchestrator.backend.cleanup(&workload.handle).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(run_id = %workload.run_id, error = %e, "Failed to remove finished workload")
                }
            }
        }
        removed
    }
}

fn existing_path(raw: &str) -> Option<PathBuf> {
    let path = PathBuf::from(raw);
    path.is_file().then_some(path)
}

/// Truncates every `.log` file above the cap to exactly the cap.
async fn truncate_oversized_logs(logs_dir: &std::path::Path, cap_mb: u64) -> usize {
    let cap_bytes = cap_mb * 1024 * 1024;
    let mut truncated = 0;
    let Ok(mut entries) = tokio::fs::read_dir(logs_dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.len() <= cap_bytes {
            continue;
        }
        match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(file) => {
                if let Err(e) = file.set_len(cap_bytes).await {
                    warn!(path = %path.display(), error = %e, "Failed to truncate log file");
                } else {
                    truncated += 1;
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to open log for truncation"),
        }
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_backup_confirms_everything() {
        let items = vec![
            BackupItem {
                run_id: Uuid::new_v4(),
                pipeline_name: "a".to_string(),
                log_path: None,
                metrics_path: None,
            },
            BackupItem {
                run_id: Uuid::new_v4(),
                pipeline_name: "b".to_string(),
                log_path: None,
                metrics_path: None,
            },
        ];
        let uploaded = NoopLogBackup.backup(&items).await.unwrap();
        assert_eq!(uploaded.len(), 2);
        assert!(uploaded.contains(&items[0].run_id));
    }

    #[tokio::test]
    async fn test_flaky_backup_recovers_under_retry() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct FlakyBackup {
            calls: AtomicU32,
        }

        #[async_trait]
        impl LogBackup for FlakyBackup {
            async fn backup(&self, items: &[BackupItem]) -> Result<Vec<Uuid>, BackupError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(BackupError("store unreachable".to_string()));
                }
                Ok(items.iter().map(|item| item.run_id).collect())
            }
        }

        // The same policy the cleanup pass uses, just with test-sized delays
        let backup = FlakyBackup {
            calls: AtomicU32::new(0),
        };
        let items = vec![BackupItem {
            run_id: Uuid::new_v4(),
            pipeline_name: "a".to_string(),
            log_path: None,
            metrics_path: None,
        }];
        let policy = BackoffPolicy {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
        };
        let uploaded = retry_with_backoff("log backup upload", policy, || backup.backup(&items))
            .await
            .unwrap();
        assert_eq!(uploaded, vec![items[0].run_id]);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_truncate_oversized_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let big = tmp.path().join("big.log");
        let small = tmp.path().join("small.log");
        let other = tmp.path().join("data.jsonl");
        tokio::fs::write(&big, vec![b'x'; 3 * 1024 * 1024]).await.unwrap();
        tokio::fs::write(&small, b"tiny").await.unwrap();
        tokio::fs::write(&other, vec![b'x'; 3 * 1024 * 1024]).await.unwrap();

        let truncated = truncate_oversized_logs(tmp.path(), 1).await;
        assert_eq!(truncated, 1);
        assert_eq!(
            tokio::fs::metadata(&big).await.unwrap().len(),
            1024 * 1024
        );
        assert_eq!(tokio::fs::metadata(&small).await.unwrap().len(), 4);
        // Non-log files are untouched
        assert_eq!(
            tokio::fs::metadata(&other).await.unwrap().len(),
            3 * 1024 * 1024
        );
    }
}
