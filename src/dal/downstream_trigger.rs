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

//! DAL for store-declared downstream triggers.

use diesel::prelude::*;

use super::models::{NewSqliteDownstreamTrigger, SqliteDownstreamTrigger};
use super::DAL;
use crate::database::schema::downstream_triggers;
use crate::database::universal_types::{current_timestamp_string, UniversalUuid};
use crate::error::ValidationError;
use crate::models::{DownstreamTrigger, NewDownstreamTrigger};

/// Data access layer for `downstream_triggers` rows.
#[derive(Clone)]
pub struct DownstreamTriggerDAL<'a> {
    dal: &'a DAL,
}

impl<'a> DownstreamTriggerDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    pub async fn create(
        &self,
        new_trigger: NewDownstreamTrigger,
    ) -> Result<DownstreamTrigger, ValidationError> {
        let id = UniversalUuid::new_v4();
        let row = NewSqliteDownstreamTrigger {
            id: id.to_blob(),
            upstream_pipeline: new_trigger.upstream_pipeline,
            downstream_pipeline: new_trigger.downstream_pipeline,
            on_success: if new_trigger.on_success { 1 } else { 0 },
            on_failure: if new_trigger.on_failure { 1 } else { 0 },
            enabled: if new_trigger.enabled { 1 } else { 0 },
            created_at: current_timestamp_string(),
        };
        self.dal
            .with_conn({
                let row = std::sync::Arc::new(row);
                move |conn| {
                    diesel::insert_into(downstream_triggers::table)
                        .values(&*row)
                        .execute(conn)
                }
            })
            .await?;
        self.get(id).await
    }

    pub async fn get(&self, id: UniversalUuid) -> Result<DownstreamTrigger, ValidationError> {
        let blob = id.to_blob();
        let row: Option<SqliteDownstreamTrigger> = self
            .dal
            .with_conn(move |conn| {
                downstream_triggers::table
                    .filter(downstream_triggers::id.eq(&blob))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.ok_or_else(|| ValidationError::NotFound(format!("downstream trigger {}", id)))?
            .try_into()
    }

    pub async fn list(&self) -> Result<Vec<DownstreamTrigger>, ValidationError> {
        let rows: Vec<SqliteDownstreamTrigger> = self
            .dal
            .with_conn(move |conn| downstream_triggers::table.load(conn))
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Enabled triggers declared for an upstream pipeline.
    pub async fn list_enabled_for(
        &self,
        upstream: &str,
    ) -> Result<Vec<DownstreamTrigger>, ValidationError> {
        let upstream = upstream.to_string();
        let rows: Vec<SqliteDownstreamTrigger> = self
            .dal
            .with_conn(move |conn| {
                downstream_triggers::table
                    .filter(downstream_triggers::upstream_pipeline.eq(&upstream))
                    .filter(downstream_triggers::enabled.eq(1))
                    .load(conn)
            })
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
        self.dal
            .with_conn(move |conn| {
                diesel::update(downstream_triggers::table)
                    .filter(downstream_triggers::id.eq(&blob))
                    .set(downstream_triggers::enabled.eq(flag))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: UniversalUuid) -> Result<(), ValidationError> {
        let blob = id.to_blob();
        self.dal
            .with_conn(move |conn| {
                diesel::delete(downstream_triggers::table.filter(downstream_triggers::id.eq(&blob)))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }
}
