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

//! Database connection management for the SQLite store using Diesel and
//! deadpool-diesel.
//!
//! SQLite has limited concurrent write support even with WAL mode; the pool
//! holds a single connection so every write serialises through it and
//! "database is locked" errors cannot occur between pooled connections.
//! WAL mode and a generous busy_timeout are set before migrations run.
//!
//! # Error Handling
//!
//! Pool construction panics: an unusable store is fatal and must surface at
//! application startup. Everything after construction returns `Result`.

use deadpool_diesel::sqlite::{Manager, Pool, Runtime};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use tracing::info;

/// Embedded SQL migrations, applied on startup.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// A pool of SQLite connections (size 1 — single writer).
///
/// `Database` is `Clone`; each clone references the same underlying pool and
/// can be freely shared across tasks.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database(sqlite)")
    }
}

impl Database {
    /// Creates a new SQLite connection pool.
    ///
    /// # Arguments
    ///
    /// * `database_path` - File path of the database, or `:memory:` for tests.
    ///   A `sqlite://` prefix is stripped if present.
    ///
    /// # Panics
    ///
    /// Panics if the pool cannot be built.
    pub fn new(database_path: &str) -> Self {
        let path = database_path
            .strip_prefix("sqlite://")
            .unwrap_or(database_path);

        let manager = Manager::new(path, Runtime::Tokio1);
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .expect("Failed to create SQLite connection pool");

        info!("SQLite connection pool initialized ({})", path);

        Self { pool }
    }

    /// Returns a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    /// Runs pending migrations, setting the concurrency pragmas first.
    pub async fn run_migrations(&self) -> Result<(), String> {
        use diesel::prelude::*;
        use diesel_migrations::MigrationHarness;

        let conn = self.pool.get().await.map_err(|e| e.to_string())?;
        conn.interact(|conn| {
            // WAL allows concurrent reads during writes; busy_timeout makes
            // SQLite wait instead of failing immediately on a held lock.
            diesel::sql_query("PRAGMA journal_mode=WAL;")
                .execute(conn)
                .map_err(|e| format!("Failed to set WAL mode: {}", e))?;
            diesel::sql_query("PRAGMA busy_timeout=30000;")
                .execute(conn)
                .map_err(|e| format!("Failed to set busy_timeout: {}", e))?;

            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| format!("Failed to run migrations: {}", e))
        })
        .await
        .map_err(|e| format!("Migration task failed: {}", e))??;

        info!("Database migrations applied");
        Ok(())
    }
}
