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

//! SQLite row models.
//!
//! Diesel model structs using SQLite-compatible types: UUIDs as BLOB
//! (`Vec<u8>`), timestamps as TEXT (RFC3339), booleans as INTEGER, JSON maps
//! as TEXT. Converted to and from domain types at the DAL boundary; a failed
//! conversion (corrupt blob, unknown status string) surfaces as a
//! `ValidationError` instead of panicking.

use std::collections::HashMap;

use diesel::prelude::*;

use crate::database::schema::*;
use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::error::{RunErrorType, ValidationError};
use crate::models::{
    CellStatus, DownstreamTrigger, JobKind, JobSource, Pipeline, PipelineRun, RunCellLog,
    RunStatus, ScheduledJob, Secret, TriggerType,
};

fn parse_env_map(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_timestamp(raw: &str) -> Result<UniversalTimestamp, ValidationError> {
    Ok(UniversalTimestamp::from_rfc3339(raw)?)
}

fn parse_opt_timestamp(raw: &Option<String>) -> Result<Option<UniversalTimestamp>, ValidationError> {
    raw.as_deref().map(parse_timestamp).transpose().map_err(Into::into)
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = pipelines)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqlitePipeline {
    pub pipeline_name: String,
    pub has_requirements: i32,
    pub last_cache_warmup: Option<String>,
    pub total_runs: i32,
    pub successful_runs: i32,
    pub failed_runs: i32,
    pub webhook_runs: i32,
}

impl TryFrom<SqlitePipeline> for Pipeline {
    type Error = ValidationError;

    fn try_from(row: SqlitePipeline) -> Result<Self, Self::Error> {
        Ok(Pipeline {
            pipeline_name: row.pipeline_name,
            has_requirements: row.has_requirements != 0,
            last_cache_warmup: parse_opt_timestamp(&row.last_cache_warmup)?,
            total_runs: row.total_runs,
            successful_runs: row.successful_runs,
            failed_runs: row.failed_runs,
            webhook_runs: row.webhook_runs,
        })
    }
}

// ============================================================================
// PipelineRun
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = pipeline_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqlitePipelineRun {
    pub id: Vec<u8>,
    pub pipeline_name: String,
    pub status: String,
    pub log_file: String,
    pub metrics_file: Option<String>,
    pub env_vars: String,
    pub parameters: String,
    pub uv_version: Option<String>,
    pub setup_duration: Option<f64>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
    pub triggered_by: String,
    pub run_config_id: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub workload_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = pipeline_runs)]
pub struct NewSqlitePipelineRun {
    pub id: Vec<u8>,
    pub pipeline_name: String,
    pub status: String,
    pub log_file: String,
    pub env_vars: String,
    pub parameters: String,
    pub started_at: String,
    pub triggered_by: String,
    pub run_config_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SqlitePipelineRun> for PipelineRun {
    type Error = ValidationError;

    fn try_from(row: SqlitePipelineRun) -> Result<Self, Self::Error> {
        let status = RunStatus::parse(&row.status)
            .ok_or_else(|| ValidationError::InvalidValue(format!("run status: {}", row.status)))?;
        let error_type = match row.error_type.as_deref() {
            Some("pipeline_error") => Some(RunErrorType::PipelineError),
            Some("infrastructure_error") => Some(RunErrorType::InfrastructureError),
            Some(other) => {
                return Err(ValidationError::InvalidValue(format!(
                    "run error_type: {}",
                    other
                )))
            }
            None => None,
        };
        Ok(PipelineRun {
            id: UniversalUuid::from_blob(&row.id)?,
            pipeline_name: row.pipeline_name,
            status,
            log_file: row.log_file,
            metrics_file: row.metrics_file,
            env_vars: parse_env_map(&row.env_vars),
            parameters: parse_env_map(&row.parameters),
            uv_version: row.uv_version,
            setup_duration: row.setup_duration,
            started_at: parse_timestamp(&row.started_at)?,
            finished_at: parse_opt_timestamp(&row.finished_at)?,
            exit_code: row.exit_code,
            triggered_by: row.triggered_by,
            run_config_id: row.run_config_id,
            error_type,
            error_message: row.error_message,
            workload_id: row.workload_id,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

// ============================================================================
// ScheduledJob
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = scheduled_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteScheduledJob {
    pub id: Vec<u8>,
    pub pipeline_name: String,
    pub trigger_type: String,
    pub trigger_value: String,
    pub enabled: i32,
    pub source: String,
    pub kind: String,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub run_config_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = scheduled_jobs)]
pub struct NewSqliteScheduledJob {
    pub id: Vec<u8>,
    pub pipeline_name: String,
    pub trigger_type: String,
    pub trigger_value: String,
    pub enabled: i32,
    pub source: String,
    pub kind: String,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub run_config_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SqliteScheduledJob> for ScheduledJob {
    type Error = ValidationError;

    fn try_from(row: SqliteScheduledJob) -> Result<Self, Self::Error> {
        let trigger_type = TriggerType::parse(&row.trigger_type).ok_or_else(|| {
            ValidationError::InvalidValue(format!("trigger type: {}", row.trigger_type))
        })?;
        let source = JobSource::parse(&row.source)
            .ok_or_else(|| ValidationError::InvalidValue(format!("job source: {}", row.source)))?;
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| ValidationError::InvalidValue(format!("job kind: {}", row.kind)))?;
        Ok(ScheduledJob {
            id: UniversalUuid::from_blob(&row.id)?,
            pipeline_name: row.pipeline_name,
            trigger_type,
            trigger_value: row.trigger_value,
            enabled: row.enabled != 0,
            source,
            kind,
            start_at: parse_opt_timestamp(&row.start_at)?,
            end_at: parse_opt_timestamp(&row.end_at)?,
            run_config_id: row.run_config_id,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

// ============================================================================
// DownstreamTrigger
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = downstream_triggers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteDownstreamTrigger {
    pub id: Vec<u8>,
    pub upstream_pipeline: String,
    pub downstream_pipeline: String,
    pub on_success: i32,
    pub on_failure: i32,
    pub enabled: i32,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = downstream_triggers)]
pub struct NewSqliteDownstreamTrigger {
    pub id: Vec<u8>,
    pub upstream_pipeline: String,
    pub downstream_pipeline: String,
    pub on_success: i32,
    pub on_failure: i32,
    pub enabled: i32,
    pub created_at: String,
}

impl TryFrom<SqliteDownstreamTrigger> for DownstreamTrigger {
    type Error = ValidationError;

    fn try_from(row: SqliteDownstreamTrigger) -> Result<Self, Self::Error> {
        Ok(DownstreamTrigger {
            id: UniversalUuid::from_blob(&row.id)?,
            upstream_pipeline: row.upstream_pipeline,
            downstream_pipeline: row.downstream_pipeline,
            on_success: row.on_success != 0,
            on_failure: row.on_failure != 0,
            enabled: row.enabled != 0,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

// ============================================================================
// Secret
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = secrets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteSecret {
    pub id: Vec<u8>,
    pub key: String,
    pub value: String,
    pub is_parameter: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = secrets)]
pub struct NewSqliteSecret {
    pub id: Vec<u8>,
    pub key: String,
    pub value: String,
    pub is_parameter: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SqliteSecret> for Secret {
    type Error = ValidationError;

    fn try_from(row: SqliteSecret) -> Result<Self, Self::Error> {
        Ok(Secret {
            id: UniversalUuid::from_blob(&row.id)?,
            key: row.key,
            value: row.value,
            is_parameter: row.is_parameter != 0,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

// ============================================================================
// RunCellLog
// ============================================================================

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = run_cell_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SqliteRunCellLog {
    pub run_id: Vec<u8>,
    pub cell_index: i32,
    pub status: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub outputs: Option<String>,
    pub updated_at: String,
}

impl TryFrom<SqliteRunCellLog> for RunCellLog {
    type Error = ValidationError;

    fn try_from(row: SqliteRunCellLog) -> Result<Self, Self::Error> {
        let status = CellStatus::parse(&row.status)
            .ok_or_else(|| ValidationError::InvalidValue(format!("cell status: {}", row.status)))?;
        Ok(RunCellLog {
            run_id: UniversalUuid::from_blob(&row.run_id)?,
            cell_index: row.cell_index,
            status,
            stdout: row.stdout,
            stderr: row.stderr,
            outputs: row
                .outputs
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}
