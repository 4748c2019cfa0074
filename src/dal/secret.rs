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

//! DAL for secrets and parameters.
//!
//! Values arrive here already encrypted (or verbatim for parameters); the
//! vault owns the cryptography. Keys are validated at this boundary.

use diesel::prelude::*;

use super::models::{NewSqliteSecret, SqliteSecret};
use super::DAL;
use crate::database::schema::secrets;
use crate::database::universal_types::{current_timestamp_string, UniversalUuid};
use crate::error::ValidationError;
use crate::models::{validate_secret_key, NewSecret, Secret};

/// Data access layer for `secrets` rows.
#[derive(Clone)]
pub struct SecretDAL<'a> {
    dal: &'a DAL,
}

impl<'a> SecretDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts or replaces a secret by key.
    pub async fn upsert(&self, new_secret: NewSecret) -> Result<Secret, ValidationError> {
        validate_secret_key(&new_secret.key)
            .map_err(|e| ValidationError::InvalidValue(e.to_string()))?;

        let now = current_timestamp_string();
        let row = NewSqliteSecret {
            id: UniversalUuid::new_v4().to_blob(),
            key: new_secret.key.clone(),
            value: new_secret.value,
            is_parameter: if new_secret.is_parameter { 1 } else { 0 },
            created_at: now.clone(),
            updated_at: now,
        };
        self.dal
            .with_conn({
                let row = std::sync::Arc::new(row);
                move |conn| {
                    diesel::insert_into(secrets::table)
                        .values(&*row)
                        .on_conflict(secrets::key)
                        .do_update()
                        .set((
                            secrets::value.eq(&row.value),
                            secrets::is_parameter.eq(row.is_parameter),
                            secrets::updated_at.eq(&row.updated_at),
                        ))
                        .execute(conn)
                }
            })
            .await?;
        self.get(&new_secret.key)
            .await?
            .ok_or_else(|| ValidationError::NotFound(format!("secret {}", new_secret.key)))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Secret>, ValidationError> {
        let key = key.to_string();
        let row: Option<SqliteSecret> = self
            .dal
            .with_conn(move |conn| {
                secrets::table
                    .filter(secrets::key.eq(&key))
                    .first(conn)
                    .optional()
            })
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Secret>, ValidationError> {
        let rows: Vec<SqliteSecret> = self
            .dal
            .with_conn(move |conn| secrets::table.order(secrets::key).load(conn))
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn delete(&self, key: &str) -> Result<bool, ValidationError> {
        let key = key.to_string();
        let deleted = self
            .dal
            .with_conn(move |conn| {
                diesel::delete(secrets::table.filter(secrets::key.eq(&key))).execute(conn)
            })
            .await?;
        Ok(deleted > 0)
    }
}
