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

//! DAL for notebook cell logs.
//!
//! Rows are keyed (run_id, cell_index) and written incrementally as cell
//! protocol lines arrive. stdout/stderr appends concatenate so retries stay
//! visible; image outputs accumulate in the JSON `outputs` column.

use diesel::prelude::*;

use super::models::SqliteRunCellLog;
use super::DAL;
use crate::database::schema::run_cell_logs;
use crate::database::universal_types::{current_timestamp_string, UniversalUuid};
use crate::error::ValidationError;
use crate::models::{CellStatus, RunCellLog};

/// Data access layer for `run_cell_logs` rows.
#[derive(Clone)]
pub struct CellLogDAL<'a> {
    dal: &'a DAL,
}

impl<'a> CellLogDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Sets a cell's status, creating the row if needed.
    pub async fn upsert_status(
        &self,
        run_id: UniversalUuid,
        cell_index: i32,
        status: CellStatus,
    ) -> Result<(), ValidationError> {
        let blob = run_id.to_blob();
        let status_str = status.as_str();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::insert_into(run_cell_logs::table)
                    .values((
                        run_cell_logs::run_id.eq(&blob),
                        run_cell_logs::cell_index.eq(cell_index),
                        run_cell_logs::status.eq(status_str),
                        run_cell_logs::updated_at.eq(&now),
                    ))
                    .on_conflict((run_cell_logs::run_id, run_cell_logs::cell_index))
                    .do_update()
                    .set((
                        run_cell_logs::status.eq(status_str),
                        run_cell_logs::updated_at.eq(&now),
                    ))
                    .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// Appends text to a cell's stdout or stderr column.
    pub async fn append_stream(
        &self,
        run_id: UniversalUuid,
        cell_index: i32,
        stderr: bool,
        text: &str,
    ) -> Result<(), ValidationError> {
        let blob = run_id.to_blob();
        let text = text.to_string();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                // Ensure the row exists before appending
                diesel::insert_into(run_cell_logs::table)
                    .values((
                        run_cell_logs::run_id.eq(&blob),
                        run_cell_logs::cell_index.eq(cell_index),
                        run_cell_logs::status.eq(CellStatus::Running.as_str()),
                        run_cell_logs::updated_at.eq(&now),
                    ))
                    .on_conflict((run_cell_logs::run_id, run_cell_logs::cell_index))
                    .do_nothing()
                    .execute(conn)?;

                let existing: Option<String> = if stderr {
                    run_cell_logs::table
                        .filter(run_cell_logs::run_id.eq(&blob))
                        .filter(run_cell_logs::cell_index.eq(cell_index))
                        .select(run_cell_logs::stderr)
                        .first(conn)?
                } else {
                    run_cell_logs::table
                        .filter(run_cell_logs::run_id.eq(&blob))
                        .filter(run_cell_logs::cell_index.eq(cell_index))
                        .select(run_cell_logs::stdout)
                        .first(conn)?
                };
                let combined = format!("{}{}", existing.unwrap_or_default(), text);

                if stderr {
                    diesel::update(
                        run_cell_logs::table
                            .filter(run_cell_logs::run_id.eq(&blob))
                            .filter(run_cell_logs::cell_index.eq(cell_index)),
                    )
                    .set((
                        run_cell_logs::stderr.eq(Some(combined)),
                        run_cell_logs::updated_at.eq(&now),
                    ))
                    .execute(conn)
                } else {
                    diesel::update(
                        run_cell_logs::table
                            .filter(run_cell_logs::run_id.eq(&blob))
                            .filter(run_cell_logs::cell_index.eq(cell_index)),
                    )
                    .set((
                        run_cell_logs::stdout.eq(Some(combined)),
                        run_cell_logs::updated_at.eq(&now),
                    ))
                    .execute(conn)
                }
            })
            .await?;
        Ok(())
    }

    /// Records an inline image output on a cell.
    pub async fn append_image(
        &self,
        run_id: UniversalUuid,
        cell_index: i32,
        mime: &str,
        data_base64: &str,
    ) -> Result<(), ValidationError> {
        let blob = run_id.to_blob();
        let mime = mime.to_string();
        let data = data_base64.to_string();
        let now = current_timestamp_string();
        self.dal
            .with_conn(move |conn| {
                diesel::insert_into(run_cell_logs::table)
                    .values((
                        run_cell_logs::run_id.eq(&blob),
                        run_cell_logs::cell_index.eq(cell_index),
                        run_cell_logs::status.eq(CellStatus::Running.as_str()),
                        run_cell_logs::updated_at.eq(&now),
                    ))
                    .on_conflict((run_cell_logs::run_id, run_cell_logs::cell_index))
                    .do_nothing()
                    .execute(conn)?;

                let existing: Option<String> = run_cell_logs::table
                    .filter(run_cell_logs::run_id.eq(&blob))
                    .filter(run_cell_logs::cell_index.eq(cell_index))
                    .select(run_cell_logs::outputs)
                    .first(conn)?;

                let mut outputs: serde_json::Value = existing
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| serde_json::json!({ "images": [] }));
                if !outputs.get("images").map(|v| v.is_array()).unwrap_or(false) {
                    outputs["images"] = serde_json::json!([]);
                }
                if let Some(images) = outputs["images"].as_array_mut() {
                    images.push(serde_json::json!({ "mime": mime, "data": data }));
                }

                diesel::update(
                    run_cell_logs::table
                        .filter(run_cell_logs::run_id.eq(&blob))
                        .filter(run_cell_logs::cell_index.eq(cell_index)),
                )
                .set((
                    run_cell_logs::outputs.eq(Some(outputs.to_string())),
                    run_cell_logs::updated_at.eq(&now),
                ))
                .execute(conn)
            })
            .await?;
        Ok(())
    }

    /// All cell rows for a run, ordered by cell index.
    pub async fn list_for_run(
        &self,
        run_id: UniversalUuid,
    ) -> Result<Vec<RunCellLog>, ValidationError> {
        let blob = run_id.to_blob();
        let rows: Vec<SqliteRunCellLog> = self
            .dal
            .with_conn(move |conn| {
                run_cell_logs::table
                    .filter(run_cell_logs::run_id.eq(&blob))
                    .order(run_cell_logs::cell_index)
                    .load(conn)
            })
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
