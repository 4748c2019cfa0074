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

//! Dependency pre-heater.
//!
//! Materialises a pipeline's Python environment in the shared uv cache
//! before any run needs it, so the container never resolves dependencies on
//! the hot path:
//!
//! 1. ensure the requested interpreter is installed (install failures are
//!    logged but not fatal — a later run may still succeed);
//! 2. compile `requirements.txt` into a pinned `requirements.txt.lock`;
//! 3. warm the managed environment with a no-op
//!    `uv run --with-requirements <lock> python -c pass`.
//!
//! uv derives the environment cache key from the **absolute** lock path, so
//! the warm-up must use the same `/app/requirements.txt.lock` path the
//! runtime will. When `/app` is not already this pipeline's directory, a
//! temporary symlink is created for the duration of the warm-up.
//!
//! Pre-heats are serialised per pipeline (one at a time per name); distinct
//! pipelines pre-heat in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::dal::DAL;
use crate::discovery::DiscoveredPipeline;

/// Per-command timeout for uv invocations.
const UV_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of one pre-heat attempt, surfaced to the UI.
#[derive(Debug, Clone)]
pub struct PreheatOutcome {
    pub success: bool,
    pub message: String,
}

impl PreheatOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// The dependency pre-heater.
pub struct Preheater {
    uv_cache_dir: PathBuf,
    uv_python_install_dir: PathBuf,
    dal: DAL,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Preheater {
    pub fn new(config: &OrchestratorConfig, dal: DAL) -> Self {
        Self {
            uv_cache_dir: config.uv_cache_dir.clone(),
            uv_python_install_dir: config.uv_python_install_dir.clone(),
            dal,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The per-pipeline serialisation lock. Submission waits on this before
    /// launching so a run never races its own pre-heat.
    pub fn lock_for(&self, pipeline_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("preheat lock map poisoned");
        locks
            .entry(pipeline_name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Installs an interpreter version into the shared cache (idempotent).
    ///
    /// Failures are logged, not returned: the run may still find the
    /// interpreter installed by an earlier pass.
    pub async fn ensure_python_version(&self, version: &str) {
        let version = version.trim();
        if version.is_empty() {
            return;
        }
        let result = self
            .run_uv(&["python", "install", version], None)
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!(version, "uv python install ok");
            }
            Ok(output) => {
                warn!(
                    version,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "uv python install failed"
                );
            }
            Err(e) => warn!(version, error = %e, "uv python install errored"),
        }
    }

    /// Pre-heats one pipeline. Idempotent; serialised per pipeline name.
    ///
    /// Records `last_cache_warmup` on success.
    pub async fn preheat(
        &self,
        pipeline: &DiscoveredPipeline,
        python_version: &str,
    ) -> PreheatOutcome {
        let requirements = pipeline.path.join("requirements.txt");
        if !requirements.is_file() {
            return PreheatOutcome::ok(format!(
                "pipeline '{}' has no requirements.txt; nothing to pre-heat",
                pipeline.name
            ));
        }

        let lock = self.lock_for(&pipeline.name);
        let _guard = lock.lock().await;

        self.ensure_python_version(python_version).await;

        // 1. Pin the manifest into requirements.txt.lock
        let lock_file = pipeline.lock_file();
        let compile = self
            .run_uv(
                &[
                    "pip",
                    "compile",
                    "--python",
                    python_version,
                    requirements.to_string_lossy().as_ref(),
                    "-o",
                    lock_file.to_string_lossy().as_ref(),
                ],
                Some(&pipeline.path),
            )
            .await;
        match compile {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let message = format!(
                    "lock file compilation failed for '{}': {}",
                    pipeline.name,
                    stderr_or_stdout(&output)
                );
                warn!("{}", message);
                return PreheatOutcome::failed(message);
            }
            Err(e) => {
                return PreheatOutcome::failed(format!(
                    "lock file compilation errored for '{}': {}",
                    pipeline.name, e
                ))
            }
        }

        if let Some(digest) = lock_digest(&lock_file) {
            debug!(pipeline = %pipeline.name, lock_sha256 = %digest, "Lock file pinned");
        }

        // 2. Warm the managed environment under the runtime's lock path
        let app_link = AppLink::establish(&pipeline.path, &lock_file);
        let warm = self
            .run_uv(
                &[
                    "run",
                    "--python",
                    python_version,
                    "--with-requirements",
                    &app_link.lock_path,
                    "python",
                    "-c",
                    "pass",
                ],
                Some(&app_link.working_dir),
            )
            .await;
        drop(app_link);

        match warm {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let message = format!(
                    "environment warm-up failed for '{}': {}",
                    pipeline.name,
                    stderr_or_stdout(&output)
                );
                warn!("{}", message);
                return PreheatOutcome::failed(message);
            }
            Err(e) => {
                return PreheatOutcome::failed(format!(
                    "environment warm-up errored for '{}': {}",
                    pipeline.name, e
                ))
            }
        }

        if let Err(e) = self.dal.pipeline().record_cache_warmup(&pipeline.name).await {
            warn!(pipeline = %pipeline.name, error = %e, "Failed to record cache warmup");
        }

        info!(pipeline = %pipeline.name, "Dependency pre-heat complete");
        PreheatOutcome::ok(format!("pre-heat complete for '{}'", pipeline.name))
    }

    /// Pre-heats every discovered pipeline with a requirements manifest.
    /// Used at startup and after git sync.
    pub async fn preheat_all(
        &self,
        pipelines: &[Arc<DiscoveredPipeline>],
        default_python: &str,
    ) -> HashMap<String, PreheatOutcome> {
        let mut results = HashMap::new();
        for pipeline in pipelines {
            if !pipeline.has_requirements {
                continue;
            }
            let version = pipeline.python_version(default_python).to_string();
            let outcome = self.preheat(pipeline, &version).await;
            results.insert(pipeline.name.clone(), outcome);
        }
        results
    }

    async fn run_uv(&self, args: &[&str], cwd: Option<&Path>) -> std::io::Result<Output> {
        let mut command = Command::new("uv");
        command
            .args(args)
            .env("UV_CACHE_DIR", &self.uv_cache_dir)
            .env("UV_PYTHON_INSTALL_DIR", &self.uv_python_install_dir)
            .env("UV_LINK_MODE", "copy")
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        match tokio::time::timeout(UV_TIMEOUT, command.output()).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("uv {} timed out after {:?}", args.join(" "), UV_TIMEOUT),
            )),
        }
    }
}

/// Content digest of the pinned lock file. The managed-environment cache is
/// keyed on (lock path, lock content); the digest makes cache reuse visible
/// in the logs across syncs.
fn lock_digest(lock_file: &Path) -> Option<String> {
    use sha2::{Digest, Sha256};
    let content = std::fs::read(lock_file).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    let digest = hasher.finalize();
    Some(
        digest
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<String>(),
    )
}

fn stderr_or_stdout(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return stderr.trim().to_string();
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Scoped `/app` symlink for the warm-up, removed on drop.
///
/// uv keys managed environments on the absolute lock path, so warming under
/// `/app/requirements.txt.lock` is what lets the runtime reuse the cache.
struct AppLink {
    /// Lock path to pass to uv
    lock_path: String,
    /// Working directory for the warm-up command
    working_dir: PathBuf,
    created_symlink: bool,
}

impl AppLink {
    fn establish(pipeline_dir: &Path, lock_file: &Path) -> Self {
        let app = Path::new("/app");

        #[cfg(unix)]
        if !app.exists() {
            match std::os::unix::fs::symlink(pipeline_dir, app) {
                Ok(()) => {
                    debug!(target = %pipeline_dir.display(), "Created temporary /app symlink");
                    return Self {
                        lock_path: "/app/requirements.txt.lock".to_string(),
                        working_dir: app.to_path_buf(),
                        created_symlink: true,
                    };
                }
                Err(e) => {
                    debug!(error = %e, "Could not create /app symlink; using absolute lock path");
                }
            }
        }

        // /app already points at this pipeline (running inside the worker
        // image layout), or the symlink could not be created.
        let app_matches = app
            .read_link()
            .ok()
            .and_then(|target| {
                let canonical_target = std::fs::canonicalize(&target).ok()?;
                let canonical_dir = std::fs::canonicalize(pipeline_dir).ok()?;
                Some(canonical_target == canonical_dir)
            })
            .unwrap_or(false);

        if app_matches {
            Self {
                lock_path: "/app/requirements.txt.lock".to_string(),
                working_dir: app.to_path_buf(),
                created_symlink: false,
            }
        } else {
            let absolute = std::fs::canonicalize(lock_file)
                .unwrap_or_else(|_| lock_file.to_path_buf());
            Self {
                lock_path: absolute.to_string_lossy().to_string(),
                working_dir: pipeline_dir.to_path_buf(),
                created_symlink: false,
            }
        }
    }
}

impl Drop for AppLink {
    fn drop(&mut self) {
        if self.created_symlink {
            if let Err(e) = std::fs::remove_file("/app") {
                warn!(error = %e, "Failed to remove temporary /app symlink");
            } else {
                debug!("Removed temporary /app symlink");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_for_returns_same_lock_per_name() {
        let config = OrchestratorConfig::default();
        let dal = DAL::new(crate::database::Database::new(":memory:"));
        let preheater = Preheater::new(&config, dal);

        let a1 = preheater.lock_for("a");
        let a2 = preheater.lock_for("a");
        let b = preheater.lock_for("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[tokio::test]
    async fn test_preheat_serialises_per_pipeline() {
        let config = OrchestratorConfig::default();
        let dal = DAL::new(crate::database::Database::new(":memory:"));
        let preheater = Arc::new(Preheater::new(&config, dal));

        // Hold pipeline a's lock; a second acquisition must wait, while
        // pipeline b proceeds immediately.
        let lock_a = preheater.lock_for("a");
        let guard = lock_a.lock().await;

        let second_a = preheater.lock_for("a");
        assert!(second_a.try_lock().is_err());
        assert!(preheater.lock_for("b").try_lock().is_ok());

        drop(guard);
        assert!(second_a.try_lock().is_ok());
    }
}
