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

//! DAL for the orchestrator settings singleton (row id = 1).

use diesel::prelude::*;

use super::DAL;
use crate::database::schema::orchestrator_settings;
use crate::database::universal_types::{current_timestamp_string, UniversalTimestamp};
use crate::error::ValidationError;
use crate::models::OrchestratorSettings;

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = orchestrator_settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct SqliteSettings {
    id: i32,
    log_retention_runs: Option<i32>,
    log_retention_days: Option<i32>,
    log_max_size_mb: Option<i32>,
    max_concurrent_runs: Option<i32>,
    dependency_audit_cron: Option<String>,
    git_sync_credentials: Option<String>,
    updated_at: String,
}

/// Data access layer for the settings singleton.
#[derive(Clone)]
pub struct SettingsDAL<'a> {
    dal: &'a DAL,
}

impl<'a> SettingsDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Fetches the singleton row, if one has been written.
    pub async fn get(&self) -> Result<Option<OrchestratorSettings>, ValidationError> {
        let row: Option<SqliteSettings> = self
            .dal
            .with_conn(move |conn| {
                orchestrator_settings::table
                    .filter(orchestrator_settings::id.eq(OrchestratorSettings::SINGLETON_ID))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.map(|row| {
            Ok(OrchestratorSettings {
                id: row.id,
                log_retention_runs: row.log_retention_runs,
                log_retention_days: row.log_retention_days,
                log_max_size_mb: row.log_max_size_mb,
                max_concurrent_runs: row.max_concurrent_runs,
                dependency_audit_cron: row.dependency_audit_cron,
                git_sync_credentials: row.git_sync_credentials,
                updated_at: UniversalTimestamp::from_rfc3339(&row.updated_at)?,
            })
        })
        .transpose()
    }

    /// Writes the singleton row, creating it when absent.
    pub async fn upsert(&self, settings: &OrchestratorSettings) -> Result<(), ValidationError> {
        let now = current_timestamp_string();
        let log_retention_runs = settings.log_retention_runs;
        let log_retention_days = settings.log_retention_days;
        let log_max_size_mb = settings.log_max_size_mb;
        let max_concurrent_runs = settings.max_concurrent_runs;
        let dependency_audit_cron = settings.dependency_audit_cron.clone();
        let git_sync_credentials = settings.git_sync_credentials.clone();
        self.dal
            .with_conn(move |conn| {
                diesel::insert_into(orchestrator_settings::table)
                    .values((
                        orchestrator_settings::id.eq(OrchestratorSettings::SINGLETON_ID),
                        orchestrator_settings::log_retention_runs.eq(log_retention_runs),
                        orchestrator_settings::log_retention_days.eq(log_retention_days),
                        orchestrator_settings::log_max_size_mb.eq(log_max_size_mb),
                        orchestrator_settings::max_concurrent_runs.eq(max_concurrent_runs),
                        orchestrator_settings::dependency_audit_cron.eq(&dependency_audit_cron),
                        orchestrator_settings::git_sync_credentials.eq(&git_sync_credentials),
                        orchestrator_settings::updated_at.eq(&now),
                    ))
                    .on_conflict(orchestrator_settings::id)
                    .do_update()
                    .set((
                        orchestrator_settings::log_retention_runs.eq(log_retention_runs),
                        orchestrator_settings::log_retention_days.eq(log_retention_days),
                        orchestrator_settings::log_max_size_mb.eq(log_max_size_mb),
                        orchestrator_settings::max_concurrent_runs.eq(max_concurrent_runs),
                        orchestrator_settings::dependency_audit_cron.eq(&dependency_audit_cron),
                        orchestrator_settings::git_sync_credentials.eq(&git_sync_credentials),
                        orchestrator_settings::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }
}
