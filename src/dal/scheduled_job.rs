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

//! DAL for scheduled jobs.
//!
//! Enforces the at-most-one-active-entry invariant per
//! (pipeline_name, trigger spec, source) and supports the wholesale
//! replacement of `pipeline_json`-sourced jobs during discovery refresh.

use diesel::prelude::*;

use super::models::{NewSqliteScheduledJob, SqliteScheduledJob};
use super::DAL;
use crate::database::schema::scheduled_jobs;
use crate::database::universal_types::{current_timestamp_string, UniversalUuid};
use crate::error::ValidationError;
use crate::models::{JobSource, NewScheduledJob, ScheduledJob};

/// Data access layer for `scheduled_jobs` rows.
#[derive(Clone)]
pub struct ScheduledJobDAL<'a> {
    dal: &'a DAL,
}

impl<'a> ScheduledJobDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Creates a job, refusing a duplicate (pipeline, trigger, source) entry.
    pub async fn create(&self, new_job: NewScheduledJob) -> Result<ScheduledJob, ValidationError> {
        let id = UniversalUuid::new_v4();
        let now = current_timestamp_string();
        let row = NewSqliteScheduledJob {
            id: id.to_blob(),
            pipeline_name: new_job.pipeline_name.clone(),
            trigger_type: new_job.trigger_type.as_str().to_string(),
            trigger_value: new_job.trigger_value.clone(),
            enabled: if new_job.enabled { 1 } else { 0 },
            source: new_job.source.as_str().to_string(),
            kind: new_job.kind.as_str().to_string(),
            start_at: new_job.start_at.map(|t| t.to_rfc3339()),
            end_at: new_job.end_at.map(|t| t.to_rfc3339()),
            run_config_id: new_job.run_config_id.clone(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.dal
            .with_conn({
                let row = std::sync::Arc::new(row);
                move |conn| {
                    let duplicates: i64 = scheduled_jobs::table
                        .filter(scheduled_jobs::pipeline_name.eq(&row.pipeline_name))
                        .filter(scheduled_jobs::trigger_type.eq(&row.trigger_type))
                        .filter(scheduled_jobs::trigger_value.eq(&row.trigger_value))
                        .filter(scheduled_jobs::source.eq(&row.source))
                        .count()
                        .get_result(conn)?;
                    if duplicates > 0 {
                        // Surfaced to the caller as a unique-violation
                        return Err(diesel::result::Error::DatabaseError(
                            diesel::result::DatabaseErrorKind::UniqueViolation,
                            Box::new(format!(
                                "schedule already exists for pipeline '{}'",
                                row.pipeline_name
                            )),
                        ));
                    }
                    diesel::insert_into(scheduled_jobs::table)
                        .values(&*row)
                        .execute(conn)
                }
            })
            .await?;
        self.get(id).await
    }

    pub async fn get(&self, id: UniversalUuid) -> Result<ScheduledJob, ValidationError> {
        let blob = id.to_blob();
        let row: Option<SqliteScheduledJob> = self
            .dal
            .with_conn(move |conn| {
                scheduled_jobs::table
                    .filter(scheduled_jobs::id.eq(&blob))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.ok_or_else(|| ValidationError::NotFound(format!("scheduled job {}", id)))?
            .try_into()
    }

    pub async fn list(&self) -> Result<Vec<ScheduledJob>, ValidationError> {
        let rows: Vec<SqliteScheduledJob> = self
            .dal
            .with_conn(move |conn| scheduled_jobs::table.load(conn))
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn set_enabled(
        &self,
        id: UniversalUuid,
        enabled: bool,
    ) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        let flag = if enabled { 1 } else { 0 };
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(scheduled_jobs::table)
                    .filter(scheduled_jobs::id.eq(&blob))
                    .set((
                        scheduled_jobs::enabled.eq(flag),
                        scheduled_jobs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: UniversalUuid) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        self.dal
            .with_conn(move |conn| {
                diesel::delete(scheduled_jobs::table.filter(scheduled_jobs::id.eq(&blob)))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Replaces every `pipeline_json`-sourced job for a pipeline with the
    /// given set, in one transaction. Api-sourced jobs are untouched.
    pub async fn replace_metadata_jobs(
        &self,
        pipeline_name: &str,
        jobs: Vec<NewScheduledJob>,
    ) -> Result<(), ValidationError> {
        let name = pipeline_name.to_string();
        let now = current_timestamp_string();
        let rows: Vec<NewSqliteScheduledJob> = jobs
            .into_iter()
            .map(|job| NewSqliteScheduledJob {
                id: UniversalUuid::new_v4().to_blob(),
                pipeline_name: job.pipeline_name,
                trigger_type: job.trigger_type.as_str().to_string(),
                trigger_value: job.trigger_value,
                enabled: if job.enabled { 1 } else { 0 },
                source: JobSource::PipelineJson.as_str().to_string(),
                kind: job.kind.as_str().to_string(),
                start_at: job.start_at.map(|t| t.to_rfc3339()),
                end_at: job.end_at.map(|t| t.to_rfc3339()),
                run_config_id: job.run_config_id,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
            .collect();

        self.dal
            .with_conn({
                let rows = std::sync::Arc::new(rows);
                move |conn| {
                    conn.transaction(|conn| {
                        diesel::delete(
                            scheduled_jobs::table
                                .filter(scheduled_jobs::pipeline_name.eq(&name))
                                .filter(
                                    scheduled_jobs::source
                                        .eq(JobSource::PipelineJson.as_str()),
                                ),
                        )
                        .execute(conn)?;
                        for row in rows.iter() {
                            diesel::insert_into(scheduled_jobs::table)
                                .values(row)
                                .execute(conn)?;
                        }
                        Ok(())
                    })
                }
            })
            .await?;
        Ok(())
    }
}
