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

//! DAL for pipeline run rows.
//!
//! Terminal transitions are guarded in SQL (`status NOT IN (...)`) so a
//! finalisation racing a cancel can never move a run out of a terminal
//! status. Finalisation is idempotent: re-running it against an already
//! terminal row is a no-op that reports `false`.

use diesel::prelude::*;

use super::models::{NewSqlitePipelineRun, SqlitePipelineRun};
use super::DAL;
use crate::database::schema::pipeline_runs;
use crate::database::universal_types::{current_timestamp_string, UniversalUuid};
use crate::error::{RunErrorType, ValidationError};
use crate::models::{NewPipelineRun, PipelineRun, RunStatus};

const TERMINAL_STATUSES: [&str; 4] = ["SUCCESS", "FAILED", "INTERRUPTED", "WARNING"];

/// Data access layer for `pipeline_runs` rows.
#[derive(Clone)]
pub struct PipelineRunDAL<'a> {
    dal: &'a DAL,
}

impl<'a> PipelineRunDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Creates a run in `PENDING` status and returns the stored row.
    pub async fn create(&self, new_run: NewPipelineRun) -> Result<PipelineRun, ValidationError> {
        self.create_with_id(UniversalUuid::new_v4(), new_run).await
    }

    /// Creates a run with a caller-chosen id (the orchestrator reserves its
    /// registry slot under the id before writing the row).
    pub async fn create_with_id(
        &self,
        id: UniversalUuid,
        new_run: NewPipelineRun,
    ) -> Result<PipelineRun, ValidationError> {
        let now = current_timestamp_string();
        let row = NewSqlitePipelineRun {
            id: id.to_blob(),
            pipeline_name: new_run.pipeline_name,
            status: RunStatus::Pending.as_str().to_string(),
            log_file: new_run.log_file,
            env_vars: serde_json::to_string(&new_run.env_vars).unwrap_or_else(|_| "{}".into()),
            parameters: serde_json::to_string(&new_run.parameters).unwrap_or_else(|_| "{}".into()),
            started_at: now.clone(),
            triggered_by: new_run.triggered_by,
            run_config_id: new_run.run_config_id,
            created_at: now.clone(),
            updated_at: now,
        };
        self.dal
            .with_conn({
                let row = std::sync::Arc::new(row);
                move |conn| {
                    diesel::insert_into(pipeline_runs::table)
                        .values(&*row)
                        .execute(conn)
                }
            })
            .await?;
        self.get(id).await
    }

    /// Fetches a run by id; `NotFound` when the row is missing.
    pub async fn get(&self, id: UniversalUuid) -> Result<PipelineRun, ValidationError> {
        let blob = id.to_blob();
        let row: Option<SqlitePipelineRun> = self
            .dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .filter(pipeline_runs::id.eq(&blob))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.ok_or_else(|| ValidationError::NotFound(format!("run {}", id)))?
            .try_into()
    }

    /// Records the backend workload id (container id / Job name).
    pub async fn set_workload(
        &self,
        id: UniversalUuid,
        workload_id: &str,
    ) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        let workload_id = workload_id.to_string();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(pipeline_runs::table)
                    .filter(pipeline_runs::id.eq(&blob))
                    .set((
                        pipeline_runs::workload_id.eq(Some(workload_id.clone())),
                        pipeline_runs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Transitions `PENDING -> RUNNING` once the workload is confirmed
    /// launching. A no-op for any other current status.
    pub async fn mark_running(&self, id: UniversalUuid) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(pipeline_runs::table)
                    .filter(pipeline_runs::id.eq(&blob))
                    .filter(pipeline_runs::status.eq(RunStatus::Pending.as_str()))
                    .set((
                        pipeline_runs::status.eq(RunStatus::Running.as_str()),
                        pipeline_runs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Forces a row back to RUNNING during zombie re-attach.
    pub async fn force_running(&self, id: UniversalUuid) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(pipeline_runs::table)
                    .filter(pipeline_runs::id.eq(&blob))
                    .set((
                        pipeline_runs::status.eq(RunStatus::Running.as_str()),
                        pipeline_runs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Records setup telemetry (uv version, setup duration).
    pub async fn set_setup_info(
        &self,
        id: UniversalUuid,
        uv_version: Option<String>,
        setup_duration: Option<f64>,
    ) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(pipeline_runs::table)
                    .filter(pipeline_runs::id.eq(&blob))
                    .set((
                        pipeline_runs::uv_version.eq(uv_version.clone()),
                        pipeline_runs::setup_duration.eq(setup_duration),
                        pipeline_runs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Records the metrics file path once sampling has produced it.
    pub async fn set_metrics_file(
        &self,
        id: UniversalUuid,
        path: &str,
    ) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        let path = path.to_string();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(pipeline_runs::table)
                    .filter(pipeline_runs::id.eq(&blob))
                    .set((
                        pipeline_runs::metrics_file.eq(Some(path.clone())),
                        pipeline_runs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Moves a run to a terminal status.
    ///
    /// Sets `finished_at` to now. Guarded so an already terminal row is left
    /// untouched; returns whether a row was updated.
    pub async fn finalize(
        &self,
        id: UniversalUuid,
        status: RunStatus,
        exit_code: Option<i64>,
        error_type: Option<RunErrorType>,
        error_message: Option<String>,
    ) -> Result<bool, ValidationError> {
        debug_assert!(status.is_terminal());
        let blob = id.to_blob();
        let status_str = status.as_str();
        let error_type_str = error_type.map(|t| t.as_str().to_string());
        let now = current_timestamp_string();
        let updated = self
            .dal
            .with_conn(move |conn| {
                diesel::update(pipeline_runs::table)
                    .filter(pipeline_runs::id.eq(&blob))
                    .filter(pipeline_runs::status.ne_all(TERMINAL_STATUSES))
                    .set((
                        pipeline_runs::status.eq(status_str),
                        pipeline_runs::exit_code.eq(exit_code),
                        pipeline_runs::finished_at.eq(Some(now.clone())),
                        pipeline_runs::error_type.eq(error_type_str.clone()),
                        pipeline_runs::error_message.eq(error_message.clone()),
                        pipeline_runs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(updated > 0)
    }

    /// Counts runs in `{PENDING, RUNNING}` for a pipeline (admission control).
    pub async fn count_active(&self, pipeline_name: &str) -> Result<i64, ValidationError> {
        let name = pipeline_name.to_string();
        self.dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .filter(pipeline_runs::pipeline_name.eq(&name))
                    .filter(pipeline_runs::status.eq_any(["PENDING", "RUNNING"]))
                    .count()
                    .get_result(conn)
            })
            .await
    }

    /// All runs currently marked RUNNING (shutdown, reconciliation).
    pub async fn list_running(&self) -> Result<Vec<PipelineRun>, ValidationError> {
        let rows: Vec<SqlitePipelineRun> = self
            .dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .filter(pipeline_runs::status.eq(RunStatus::Running.as_str()))
                    .load(conn)
            })
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// A pipeline's single RUNNING run, if any (daemon restart).
    pub async fn find_running(
        &self,
        pipeline_name: &str,
    ) -> Result<Option<PipelineRun>, ValidationError> {
        let name = pipeline_name.to_string();
        let row: Option<SqlitePipelineRun> = self
            .dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .filter(pipeline_runs::pipeline_name.eq(&name))
                    .filter(pipeline_runs::status.eq(RunStatus::Running.as_str()))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Terminal runs beyond the `keep` most recent for a pipeline,
    /// oldest first (count-based retention).
    pub async fn terminal_runs_beyond(
        &self,
        pipeline_name: &str,
        keep: i64,
    ) -> Result<Vec<PipelineRun>, ValidationError> {
        let name = pipeline_name.to_string();
        let rows: Vec<SqlitePipelineRun> = self
            .dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .filter(pipeline_runs::pipeline_name.eq(&name))
                    .filter(pipeline_runs::status.eq_any(TERMINAL_STATUSES))
                    .order(pipeline_runs::started_at.desc())
                    .limit(i64::MAX)
                    .offset(keep)
                    .load(conn)
            })
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Terminal runs that started before the cutoff (age-based retention).
    pub async fn terminal_runs_started_before(
        &self,
        cutoff_rfc3339: &str,
    ) -> Result<Vec<PipelineRun>, ValidationError> {
        let cutoff = cutoff_rfc3339.to_string();
        let rows: Vec<SqlitePipelineRun> = self
            .dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .filter(pipeline_runs::status.eq_any(TERMINAL_STATUSES))
                    .filter(pipeline_runs::started_at.lt(&cutoff))
                    .load(conn)
            })
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Distinct pipeline names present in the run table.
    pub async fn pipeline_names(&self) -> Result<Vec<String>, ValidationError> {
        self.dal
            .with_conn(move |conn| {
                pipeline_runs::table
                    .select(pipeline_runs::pipeline_name)
                    .distinct()
                    .load(conn)
            })
            .await
    }

    /// Deletes a run row (after retention cleanup removed its files).
    pub async fn delete(&self, id: UniversalUuid) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        self.dal
            .with_conn(move |conn| {
                diesel::delete(pipeline_runs::table.filter(pipeline_runs::id.eq(&blob)))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }
}
