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

//! Integration tests over an in-memory SQLite store.

mod dal;
mod downstream;
mod vault_store;

use fastflow::{Database, DAL};

/// Fresh in-memory database with migrations applied.
pub async fn test_dal() -> DAL {
    let database = Database::new(":memory:");
    database
        .run_migrations()
        .await
        .expect("migrations should apply");
    DAL::new(database)
}
