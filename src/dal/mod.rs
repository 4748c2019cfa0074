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

//! Data Access Layer for the SQLite store.
//!
//! One sub-DAL per entity, all sharing a single pooled connection. Every
//! operation runs on the pool's interact thread; writes that hit a transient
//! "database is locked/busy" error are retried on a short backoff before the
//! error surfaces.
//!
//! # Example
//!
//! ```rust,ignore
//! let dal = DAL::new(database);
//! let run = dal.pipeline_run().get(run_id).await?;
//! dal.pipeline().record_run_outcome("hello", true, false).await?;
//! ```

use std::time::Duration;

use diesel::result::Error as DieselError;
use diesel::SqliteConnection;
use tracing::warn;

use crate::database::Database;
use crate::error::ValidationError;

pub mod cell_log;
pub mod downstream_trigger;
pub(crate) mod models;
pub mod pipeline;
pub mod pipeline_run;
pub mod scheduled_job;
pub mod secret;
pub mod settings;

pub use cell_log::CellLogDAL;
pub use downstream_trigger::DownstreamTriggerDAL;
pub use pipeline::PipelineDAL;
pub use pipeline_run::PipelineRunDAL;
pub use scheduled_job::ScheduledJobDAL;
pub use secret::SecretDAL;
pub use settings::SettingsDAL;

/// How many times a transiently-failing statement is retried.
const TRANSIENT_RETRIES: u32 = 3;

/// Backoff between transient retries.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// The Data Access Layer hub.
///
/// `DAL` is `Clone`; each clone references the same connection pool.
#[derive(Clone, Debug)]
pub struct DAL {
    database: Database,
}

impl DAL {
    /// Creates a new DAL over the given database.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn pipeline(&self) -> PipelineDAL<'_> {
        PipelineDAL::new(self)
    }

    pub fn pipeline_run(&self) -> PipelineRunDAL<'_> {
        PipelineRunDAL::new(self)
    }

    pub fn scheduled_job(&self) -> ScheduledJobDAL<'_> {
        ScheduledJobDAL::new(self)
    }

    pub fn downstream_trigger(&self) -> DownstreamTriggerDAL<'_> {
        DownstreamTriggerDAL::new(self)
    }

    pub fn secret(&self) -> SecretDAL<'_> {
        SecretDAL::new(self)
    }

    pub fn settings(&self) -> SettingsDAL<'_> {
        SettingsDAL::new(self)
    }

    pub fn cell_log(&self) -> CellLogDAL<'_> {
        CellLogDAL::new(self)
    }

    /// Runs a statement on the pooled connection, retrying transient
    /// lock/busy failures.
    pub(crate) async fn with_conn<T, F>(&self, op: F) -> Result<T, ValidationError>
    where
        F: Fn(&mut SqliteConnection) -> Result<T, DieselError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt = 0u32;
        loop {
            let conn = self
                .database
                .pool()
                .get()
                .await
                .map_err(|e| ValidationError::ConnectionPool(e.to_string()))?;

            let op_for_attempt = op.clone();
            match conn.interact(move |conn| op_for_attempt(conn)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if is_transient(&e) && attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    warn!(
                        attempt,
                        error = %e,
                        "Transient database error, retrying"
                    );
                    tokio::time::sleep(TRANSIENT_BACKOFF * attempt).await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(ValidationError::ConnectionPool(e.to_string())),
            }
        }
    }
}

/// SQLite reports lock contention as a database error mentioning
/// "locked" or "busy"; those are the only errors worth retrying.
fn is_transient(error: &DieselError) -> bool {
    match error {
        DieselError::DatabaseError(_, info) => {
            let message = info.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::DatabaseErrorKind;

    #[test]
    fn test_transient_detection() {
        let locked = DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("database is locked".to_string()),
        );
        assert!(is_transient(&locked));

        let busy = DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("database table is busy".to_string()),
        );
        assert!(is_transient(&busy));

        assert!(!is_transient(&DieselError::NotFound));
        let constraint = DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new("UNIQUE constraint failed".to_string()),
        );
        assert!(!is_transient(&constraint));
    }
}
