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

//! DAL for pipeline aggregate records.
//!
//! Counter updates are single UPDATE statements with SQL-level arithmetic so
//! concurrent finalisations never lose increments.

use diesel::prelude::*;

use super::models::SqlitePipeline;
use super::DAL;
use crate::database::schema::pipelines;
use crate::database::universal_types::current_timestamp_string;
use crate::error::ValidationError;
use crate::models::Pipeline;

/// Data access layer for `pipelines` rows.
#[derive(Clone)]
pub struct PipelineDAL<'a> {
    dal: &'a DAL,
}

impl<'a> PipelineDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Fetches a pipeline row by name.
    pub async fn get(&self, name: &str) -> Result<Option<Pipeline>, ValidationError> {
        let name = name.to_string();
        let row: Option<SqlitePipeline> = self
            .dal
            .with_conn(move |conn| {
                pipelines::table
                    .filter(pipelines::pipeline_name.eq(&name))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.map(Pipeline::try_from).transpose()
    }

    /// Lists all pipeline rows.
    pub async fn list(&self) -> Result<Vec<Pipeline>, ValidationError> {
        let rows: Vec<SqlitePipeline> = self
            .dal
            .with_conn(move |conn| pipelines::table.order(pipelines::pipeline_name).load(conn))
            .await?;
        rows.into_iter().map(Pipeline::try_from).collect()
    }

    /// Ensures a row exists for the pipeline and records whether a
    /// requirements manifest was found. Called from discovery refresh.
    pub async fn upsert(&self, name: &str, has_requirements: bool) -> Result<(), ValidationError> {
        let name = name.to_string();
        let flag = if has_requirements { 1 } else { 0 };
        self.dal
            .with_conn(move |conn| {
                diesel::insert_into(pipelines::table)
                    .values((
                        pipelines::pipeline_name.eq(&name),
                        pipelines::has_requirements.eq(flag),
                    ))
                    .on_conflict(pipelines::pipeline_name)
                    .do_update()
                    .set(pipelines::has_requirements.eq(flag))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Records a successful dependency pre-heat.
    pub async fn record_cache_warmup(&self, name: &str) -> Result<(), ValidationError> {
        let name = name.to_string();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::insert_into(pipelines::table)
                    .values((
                        pipelines::pipeline_name.eq(&name),
                        pipelines::has_requirements.eq(1),
                        pipelines::last_cache_warmup.eq(Some(now.clone())),
                    ))
                    .on_conflict(pipelines::pipeline_name)
                    .do_update()
                    .set(pipelines::last_cache_warmup.eq(Some(now.clone())))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Atomically bumps the run counters after a run finalises.
    ///
    /// `total_runs` always increments; exactly one of `successful_runs` /
    /// `failed_runs` increments; `webhook_runs` increments when the run was
    /// webhook-triggered.
    pub async fn record_run_outcome(
        &self,
        name: &str,
        success: bool,
        webhook: bool,
    ) -> Result<(), ValidationError> {
        let name = name.to_string();
        let success_inc = if success { 1 } else { 0 };
        let failed_inc = if success { 0 } else { 1 };
        let webhook_inc = if webhook { 1 } else { 0 };
        self.dal
            .with_conn(move |conn| {
                // Row may not exist yet for a pipeline that never pre-heated
                diesel::insert_into(pipelines::table)
                    .values(pipelines::pipeline_name.eq(&name))
                    .on_conflict(pipelines::pipeline_name)
                    .do_nothing()
                    .execute(conn)?;

                diesel::update(pipelines::table)
                    .filter(pipelines::pipeline_name.eq(&name))
                    .set((
                        pipelines::total_runs.eq(pipelines::total_runs + 1),
                        pipelines::successful_runs.eq(pipelines::successful_runs + success_inc),
                        pipelines::failed_runs.eq(pipelines::failed_runs + failed_inc),
                        pipelines::webhook_runs.eq(pipelines::webhook_runs + webhook_inc),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Bumps `total_runs` alone, for runs ending interrupted or warning.
    pub async fn record_run_interrupted(&self, name: &str) -> Result<(), ValidationError> {
        let name = name.to_string();
        self.dal
            .with_conn(move |conn| {
                diesel::insert_into(pipelines::table)
                    .values(pipelines::pipeline_name.eq(&name))
                    .on_conflict(pipelines::pipeline_name)
                    .do_nothing()
                    .execute(conn)?;
                diesel::update(pipelines::table)
                    .filter(pipelines::pipeline_name.eq(&name))
                    .set(pipelines::total_runs.eq(pipelines::total_runs + 1))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Explicit counter reset; the only path that decrements.
    pub async fn reset_counters(&self, name: &str) -> Result<(), ValidationError> {
        let name = name.to_string();
        self.dal
            .with_conn(move |conn| {
                diesel::update(pipelines::table)
                    .filter(pipelines::pipeline_name.eq(&name))
                    .set((
                        pipelines::total_runs.eq(0),
                        pipelines::successful_runs.eq(0),
                        pipelines::failed_runs.eq(0),
                        pipelines::webhook_runs.eq(0),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }
}
