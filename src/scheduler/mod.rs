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

//! The pipeline scheduler.
//!
//! Jobs persist in the relational store and survive restarts. Supported
//! triggers: 5-field cron expressions (minute hour day month day-of-week),
//! fixed intervals in seconds, and one-shot instants. Each job fires at most
//! once concurrently; an overlapping fire is dropped.
//!
//! On startup the scheduler reconciles its registered jobs with the database
//! rows (add missing, remove disabled). On every successful discovery
//! refresh, jobs sourced from pipeline metadata are diffed and replaced to
//! match the current `schedule_cron` / `schedule_interval_seconds` /
//! `run_once_at` / `restart_interval` fields; api-sourced jobs are always
//! preserved.

mod trigger;

pub use trigger::JobTrigger;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dal::DAL;
use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::discovery::{DiscoveredPipeline, PipelineDiscovery};
use crate::error::SchedulerError;
use crate::models::{JobKind, JobSource, NewScheduledJob, ScheduledJob, TriggerType};
use crate::orchestrator::{Orchestrator, SubmitRequest};

/// How often the scheduler loop wakes to check for due jobs.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One registered job with its computed next fire time.
struct RegisteredJob {
    job: ScheduledJob,
    trigger: JobTrigger,
    next_fire: Option<DateTime<Utc>>,
    in_flight: Arc<AtomicBool>,
}

/// The scheduler.
pub struct PipelineScheduler {
    orchestrator: Orchestrator,
    jobs: Mutex<HashMap<Uuid, RegisteredJob>>,
    running: AtomicBool,
}

impl PipelineScheduler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn dal(&self) -> &DAL {
        self.orchestrator.dal()
    }

    /// Starts the tick loop; jobs are loaded from the database first.
    pub async fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        if let Err(e) = self.sync_from_database().await {
            error!(error = %e, "Initial scheduler sync failed");
        }
        info!("Scheduler started");

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while self.running.load(Ordering::SeqCst) {
                tick.tick().await;
                Self::fire_due_jobs(&self);
            }
            debug!("Scheduler loop stopped");
        })
    }

    /// Stops the tick loop; persisted jobs are untouched.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// Creates a persistent api-sourced job and registers it.
    pub async fn add_job(
        &self,
        pipeline_name: &str,
        trigger_type: TriggerType,
        trigger_value: &str,
        enabled: bool,
        run_config_id: Option<String>,
    ) -> Result<ScheduledJob, SchedulerError> {
        if self
            .orchestrator
            .discovery()
            .get(pipeline_name)
            .ok()
            .flatten()
            .is_none()
        {
            return Err(SchedulerError::PipelineNotFound(pipeline_name.to_string()));
        }
        // Validate before persisting
        JobTrigger::parse(trigger_type, trigger_value)?;

        let job = self
            .dal()
            .scheduled_job()
            .create(NewScheduledJob {
                pipeline_name: pipeline_name.to_string(),
                trigger_type,
                trigger_value: trigger_value.to_string(),
                enabled,
                source: JobSource::Api,
                kind: JobKind::Submit,
                start_at: None,
                end_at: None,
                run_config_id,
            })
            .await?;

        if enabled {
            self.register(job.clone());
        }
        info!(job_id = %job.id, pipeline = %pipeline_name, "Scheduled job created");
        Ok(job)
    }

    /// Enables or disables a job in both the store and the registry.
    pub async fn set_job_enabled(&self, job_id: Uuid, enabled: bool) -> Result<(), SchedulerError> {
        let id = UniversalUuid(job_id);
        let job = self.dal().scheduled_job().get(id).await.map_err(|_| {
            SchedulerError::JobNotFound(job_id)
        })?;
        self.dal().scheduled_job().set_enabled(id, enabled).await?;
        if enabled {
            self.register(ScheduledJob {
                enabled: true,
                ..job
            });
        } else {
            self.unregister(job_id);
        }
        Ok(())
    }

    /// Deletes a job from the store and the registry.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let id = UniversalUuid(job_id);
        self.dal()
            .scheduled_job()
            .get(id)
            .await
            .map_err(|_| SchedulerError::JobNotFound(job_id))?;
        self.dal().scheduled_job().delete(id).await?;
        self.unregister(job_id);
        info!(job_id = %job_id, "Scheduled job deleted");
        Ok(())
    }

    /// Reconciles registered jobs with the database: register missing
    /// enabled jobs, drop disabled or deleted ones.
    pub async fn sync_from_database(&self) -> Result<(), SchedulerError> {
        let rows = self.dal().scheduled_job().list().await?;
        let mut jobs = self.jobs.lock().expect("scheduler jobs poisoned");

        let row_ids: std::collections::HashSet<Uuid> =
            rows.iter().filter(|j| j.enabled).map(|j| j.id.0).collect();
        jobs.retain(|id, _| row_ids.contains(id));

        let mut registered = 0;
        for row in rows {
            if !row.enabled || jobs.contains_key(&row.id.0) {
                continue;
            }
            match JobTrigger::parse(row.trigger_type, &row.trigger_value) {
                Ok(trigger) => {
                    let next_fire = next_fire_in_window(&trigger, &row, Utc::now());
                    jobs.insert(
                        row.id.0,
                        RegisteredJob {
                            job: row,
                            trigger,
                            next_fire,
                            in_flight: Arc::new(AtomicBool::new(false)),
                        },
                    );
                    registered += 1;
                }
                Err(e) => {
                    warn!(job_id = %row.id, error = %e, "Skipping job with invalid trigger");
                }
            }
        }
        info!(
            total = jobs.len(),
            newly_registered = registered,
            "Scheduler synchronized with database"
        );
        Ok(())
    }

    /// Replaces `pipeline_json`-sourced jobs to match the current metadata
    /// of every discovered pipeline, then re-syncs. Called after every
    /// successful discovery refresh.
    pub async fn reconcile_metadata_jobs(
        &self,
        discovery: &PipelineDiscovery,
    ) -> Result<(), SchedulerError> {
        let pipelines = discovery.discover(true).map_err(|e| {
            SchedulerError::Validation(crate::error::ValidationError::InvalidValue(e.to_string()))
        })?;

        // Pipelines that vanished lose their metadata jobs too
        let existing = self.dal().scheduled_job().list().await?;
        let discovered_names: std::collections::HashSet<&str> =
            pipelines.iter().map(|p| p.name.as_str()).collect();
        for job in existing
            .iter()
            .filter(|j| j.source == JobSource::PipelineJson)
        {
            if !discovered_names.contains(job.pipeline_name.as_str()) {
                self.dal()
                    .scheduled_job()
                    .replace_metadata_jobs(&job.pipeline_name, Vec::new())
                    .await?;
            }
        }

        for pipeline in &pipelines {
            let desired = metadata_jobs_for(pipeline);
            self.dal()
                .scheduled_job()
                .replace_metadata_jobs(&pipeline.name, desired)
                .await?;
        }

        self.sync_from_database().await
    }

    fn register(&self, job: ScheduledJob) {
        match JobTrigger::parse(job.trigger_type, &job.trigger_value) {
            Ok(trigger) => {
                let next_fire = next_fire_in_window(&trigger, &job, Utc::now());
                let mut jobs = self.jobs.lock().expect("scheduler jobs poisoned");
                jobs.insert(
                    job.id.0,
                    RegisteredJob {
                        job,
                        trigger,
                        next_fire,
                        in_flight: Arc::new(AtomicBool::new(false)),
                    },
                );
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "Cannot register job"),
        }
    }

    fn unregister(&self, job_id: Uuid) {
        let mut jobs = self.jobs.lock().expect("scheduler jobs poisoned");
        jobs.remove(&job_id);
    }

    /// One tick: fire every job whose next occurrence has passed.
    fn fire_due_jobs(scheduler: &Arc<Self>) {
        let now = Utc::now();
        let mut due: Vec<(Uuid, String, JobKind, Option<String>, Arc<AtomicBool>)> = Vec::new();

        {
            let mut jobs = scheduler.jobs.lock().expect("scheduler jobs poisoned");
            let mut expired = Vec::new();
            for (id, registered) in jobs.iter_mut() {
                let Some(fire_at) = registered.next_fire else {
                    // One-shot jobs with no further occurrence expire
                    if matches!(registered.trigger, JobTrigger::Once(_)) {
                        expired.push(*id);
                    }
                    continue;
                };
                if fire_at > now {
                    continue;
                }
                registered.next_fire = registered.trigger.next_occurrence(now).and_then(|next| {
                    clamp_to_window(next, &registered.job)
                });
                due.push((
                    *id,
                    registered.job.pipeline_name.clone(),
                    registered.job.kind,
                    registered.job.run_config_id.clone(),
                    Arc::clone(&registered.in_flight),
                ));
            }
            for id in expired {
                jobs.remove(&id);
            }
        }

        for (job_id, pipeline_name, kind, run_config_id, in_flight) in due {
            // At most one concurrent instance per job; overlaps are dropped
            if in_flight.swap(true, Ordering::SeqCst) {
                debug!(job_id = %job_id, pipeline = %pipeline_name, "Previous fire still running; dropped");
                continue;
            }
            let scheduler = Arc::clone(scheduler);
            tokio::spawn(async move {
                scheduler
                    .execute_job(job_id, &pipeline_name, kind, run_config_id)
                    .await;
                in_flight.store(false, Ordering::SeqCst);
            });
        }
    }

    async fn execute_job(
        &self,
        job_id: Uuid,
        pipeline_name: &str,
        kind: JobKind,
        run_config_id: Option<String>,
    ) {
        // Validate the pipeline still exists and is enabled at fire time
        match self.orchestrator.discovery().get(pipeline_name) {
            Ok(Some(pipeline)) if pipeline.is_enabled() => {}
            Ok(Some(_)) => {
                debug!(job_id = %job_id, pipeline = %pipeline_name, "Pipeline disabled; fire skipped");
                return;
            }
            Ok(None) => {
                warn!(job_id = %job_id, pipeline = %pipeline_name, "Pipeline not found; fire skipped");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Discovery failed; fire skipped");
                return;
            }
        }

        match kind {
            JobKind::Submit => {
                match self
                    .orchestrator
                    .submit(
                        pipeline_name,
                        SubmitRequest {
                            triggered_by: "scheduler".to_string(),
                            run_config_id,
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(run) => {
                        info!(job_id = %job_id, pipeline = %pipeline_name, run_id = %run.id, "Scheduled run submitted")
                    }
                    Err(e) => {
                        error!(job_id = %job_id, pipeline = %pipeline_name, error = %e, "Scheduled submission failed")
                    }
                }
            }
            JobKind::DaemonRestart => {
                crate::daemon::perform_daemon_restart(
                    self.orchestrator.clone(),
                    pipeline_name.to_string(),
                )
                .await;
            }
        }
    }
}

/// Builds the metadata-sourced jobs a pipeline currently declares.
fn metadata_jobs_for(pipeline: &DiscoveredPipeline) -> Vec<NewScheduledJob> {
    let meta = &pipeline.metadata;
    let mut jobs = Vec::new();

    let start_at = meta
        .schedule_start
        .as_deref()
        .and_then(|s| UniversalTimestamp::from_rfc3339(s).ok());
    let end_at = meta
        .schedule_end
        .as_deref()
        .and_then(|s| UniversalTimestamp::from_rfc3339(s).ok());

    if let Some(cron) = &meta.schedule_cron {
        jobs.push(NewScheduledJob {
            pipeline_name: pipeline.name.clone(),
            trigger_type: TriggerType::Cron,
            trigger_value: cron.clone(),
            enabled: meta.enabled,
            source: JobSource::PipelineJson,
            kind: JobKind::Submit,
            start_at,
            end_at,
            run_config_id: None,
        });
    } else if let Some(seconds) = meta.schedule_interval_seconds {
        jobs.push(NewScheduledJob {
            pipeline_name: pipeline.name.clone(),
            trigger_type: TriggerType::Interval,
            trigger_value: seconds.to_string(),
            enabled: meta.enabled,
            source: JobSource::PipelineJson,
            kind: JobKind::Submit,
            start_at,
            end_at,
            run_config_id: None,
        });
    }

    if let Some(instant) = &meta.run_once_at {
        jobs.push(NewScheduledJob {
            pipeline_name: pipeline.name.clone(),
            trigger_type: TriggerType::Once,
            trigger_value: instant.clone(),
            enabled: meta.enabled,
            source: JobSource::PipelineJson,
            kind: JobKind::Submit,
            start_at: None,
            end_at: None,
            run_config_id: None,
        });
    }

    if let Some(restart_interval) = &meta.restart_interval {
        // Cron expression or plain seconds
        let trigger_type = if restart_interval.chars().all(|c| c.is_ascii_digit()) {
            TriggerType::Interval
        } else {
            TriggerType::Cron
        };
        jobs.push(NewScheduledJob {
            pipeline_name: pipeline.name.clone(),
            trigger_type,
            trigger_value: restart_interval.clone(),
            enabled: meta.enabled,
            source: JobSource::PipelineJson,
            kind: JobKind::DaemonRestart,
            start_at: None,
            end_at: None,
            run_config_id: None,
        });
    }

    jobs
}

/// First occurrence at or after `now`, clamped to the job's window.
fn next_fire_in_window(
    trigger: &JobTrigger,
    job: &ScheduledJob,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let floor = match job.start_at {
        Some(start) if start.0 > now => start.0,
        _ => now,
    };
    trigger
        .next_occurrence(floor)
        .and_then(|next| clamp_to_window(next, job))
}

fn clamp_to_window(candidate: DateTime<Utc>, job: &ScheduledJob) -> Option<DateTime<Utc>> {
    if let Some(end) = job.end_at {
        if candidate > end.0 {
            return None;
        }
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PipelineMetadata;
    use std::path::PathBuf;

    fn pipeline(meta: PipelineMetadata) -> DiscoveredPipeline {
        DiscoveredPipeline {
            name: "p".to_string(),
            path: PathBuf::from("/pipelines/p"),
            has_requirements: false,
            metadata: meta,
        }
    }

    #[test]
    fn test_metadata_jobs_cron() {
        let mut meta = PipelineMetadata::default();
        meta.schedule_cron = Some("0 9 * * *".to_string());
        let jobs = metadata_jobs_for(&pipeline(meta));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger_type, TriggerType::Cron);
        assert_eq!(jobs[0].kind, JobKind::Submit);
        assert_eq!(jobs[0].source, JobSource::PipelineJson);
    }

    #[test]
    fn test_metadata_jobs_interval_and_restart() {
        let mut meta = PipelineMetadata::default();
        meta.schedule_interval_seconds = Some(300);
        meta.restart_interval = Some("0 3 * * *".to_string());
        let jobs = metadata_jobs_for(&pipeline(meta));
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].trigger_type, TriggerType::Interval);
        assert_eq!(jobs[0].trigger_value, "300");
        assert_eq!(jobs[1].kind, JobKind::DaemonRestart);
        assert_eq!(jobs[1].trigger_type, TriggerType::Cron);
    }

    #[test]
    fn test_metadata_jobs_restart_interval_seconds() {
        let mut meta = PipelineMetadata::default();
        meta.restart_interval = Some("86400".to_string());
        let jobs = metadata_jobs_for(&pipeline(meta));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger_type, TriggerType::Interval);
        assert_eq!(jobs[0].kind, JobKind::DaemonRestart);
    }

    #[test]
    fn test_metadata_jobs_run_once() {
        let mut meta = PipelineMetadata::default();
        meta.run_once_at = Some("2030-01-01T09:00:00Z".to_string());
        let jobs = metadata_jobs_for(&pipeline(meta));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger_type, TriggerType::Once);
    }

    #[test]
    fn test_metadata_jobs_none_declared() {
        assert!(metadata_jobs_for(&pipeline(PipelineMetadata::default())).is_empty());
    }
}
