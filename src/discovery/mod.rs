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

//! Pipeline discovery and metadata loading.
//!
//! Scans the pipelines root for candidate directories, validates each
//! (entry file present for its declared type), loads and normalises the
//! metadata document, and caches the result with a TTL. `invalidate` is
//! called after every successful git sync.
//!
//! A missing root directory is fatal; per-pipeline errors are isolated and
//! logged, never aborting the scan.

pub mod metadata;

pub use metadata::{
    CellRetrySpec, DownstreamTriggerSpec, EntryType, PipelineMetadata, ScheduleOverride,
};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::DiscoveryError;

/// A pipeline found under the pipelines root.
#[derive(Debug, Clone)]
pub struct DiscoveredPipeline {
    /// Directory name under the root
    pub name: String,
    /// Absolute path of the pipeline directory
    pub path: PathBuf,
    /// Whether a requirements.txt is present
    pub has_requirements: bool,
    pub metadata: PipelineMetadata,
}

impl DiscoveredPipeline {
    pub fn is_enabled(&self) -> bool {
        self.metadata.enabled
    }

    pub fn entry_type(&self) -> EntryType {
        self.metadata.entry_type
    }

    /// Interpreter version, falling back to the configured default.
    pub fn python_version<'a>(&'a self, default: &'a str) -> &'a str {
        self.metadata.python_version.as_deref().unwrap_or(default)
    }

    /// Path of the requirements lock file, when one has been compiled.
    pub fn lock_file(&self) -> PathBuf {
        self.path.join("requirements.txt.lock")
    }
}

struct CacheEntry {
    pipelines: Vec<Arc<DiscoveredPipeline>>,
    refreshed_at: Instant,
}

/// Discovery service with a TTL cache.
pub struct PipelineDiscovery {
    root: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<CacheEntry>>,
}

impl PipelineDiscovery {
    /// Creates a discovery service over `root`. A TTL of zero disables
    /// caching entirely.
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Scans (or serves from cache) all valid pipelines.
    pub fn discover(
        &self,
        force_refresh: bool,
    ) -> Result<Vec<Arc<DiscoveredPipeline>>, DiscoveryError> {
        if !force_refresh && !self.ttl.is_zero() {
            let cache = self.cache.lock().expect("discovery cache poisoned");
            if let Some(entry) = cache.as_ref() {
                if entry.refreshed_at.elapsed() < self.ttl {
                    return Ok(entry.pipelines.clone());
                }
            }
        }

        let pipelines = self.scan()?;
        let mut cache = self.cache.lock().expect("discovery cache poisoned");
        *cache = Some(CacheEntry {
            pipelines: pipelines.clone(),
            refreshed_at: Instant::now(),
        });
        Ok(pipelines)
    }

    /// Looks up a single pipeline by name.
    pub fn get(&self, name: &str) -> Result<Option<Arc<DiscoveredPipeline>>, DiscoveryError> {
        Ok(self
            .discover(false)?
            .into_iter()
            .find(|p| p.name == name))
    }

    /// Clears the cache; called after every successful git sync.
    pub fn invalidate(&self) {
        let mut cache = self.cache.lock().expect("discovery cache poisoned");
        *cache = None;
    }

    /// Enables or disables a pipeline by rewriting its metadata file
    /// atomically (write tmp, rename), then invalidating the cache.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), DiscoveryError> {
        self.patch_metadata(name, |data| {
            data.insert("enabled".to_string(), serde_json::Value::Bool(enabled));
        })
    }

    /// Sets or removes a pipeline's webhook key; None or empty disables
    /// webhooks by removing the key.
    pub fn set_webhook_key(&self, name: &str, key: Option<&str>) -> Result<(), DiscoveryError> {
        let normalized = key.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string);
        self.patch_metadata(name, move |data| match &normalized {
            Some(key) => {
                data.insert(
                    "webhook_key".to_string(),
                    serde_json::Value::String(key.clone()),
                );
            }
            None => {
                data.remove("webhook_key");
            }
        })
    }

    fn scan(&self) -> Result<Vec<Arc<DiscoveredPipeline>>, DiscoveryError> {
        if !self.root.exists() {
            return Err(DiscoveryError::RootMissing(self.root.clone()));
        }
        if !self.root.is_dir() {
            return Err(DiscoveryError::NotADirectory(self.root.clone()));
        }

        let mut discovered = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }

            let metadata = load_metadata(&path, &name);
            let entry_file = path.join(metadata.entry_type.entry_file());
            if !entry_file.is_file() {
                debug!(
                    pipeline = %name,
                    entry_file = %entry_file.display(),
                    "Skipping directory without entry file"
                );
                continue;
            }

            let has_requirements = path.join("requirements.txt").is_file();
            discovered.push(Arc::new(DiscoveredPipeline {
                name,
                path,
                has_requirements,
                metadata,
            }));
        }
        discovered.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(discovered)
    }

    fn patch_metadata<F>(&self, name: &str, mutate: F) -> Result<(), DiscoveryError>
    where
        F: FnOnce(&mut serde_json::Map<String, serde_json::Value>),
    {
        let pipeline = self
            .get(name)?
            .ok_or_else(|| DiscoveryError::NotFound(name.to_string()))?;

        let metadata_path = metadata_path(&pipeline.path, name)
            .unwrap_or_else(|| pipeline.path.join("pipeline.json"));

        let mut data: serde_json::Map<String, serde_json::Value> = if metadata_path.is_file() {
            let raw = std::fs::read_to_string(&metadata_path)?;
            serde_json::from_str(&raw).map_err(|e| DiscoveryError::MetadataWrite {
                pipeline: name.to_string(),
                message: format!("existing metadata is not valid JSON: {}", e),
            })?
        } else {
            serde_json::Map::new()
        };

        mutate(&mut data);

        let tmp_path = metadata_path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(&serde_json::Value::Object(data))
            .map_err(|e| DiscoveryError::MetadataWrite {
                pipeline: name.to_string(),
                message: e.to_string(),
            })?;
        std::fs::write(&tmp_path, serialized)?;
        if let Err(e) = std::fs::rename(&tmp_path, &metadata_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.invalidate();
        Ok(())
    }
}

/// Metadata file for a pipeline: `pipeline.json` wins over `{name}.json`.
fn metadata_path(pipeline_dir: &Path, name: &str) -> Option<PathBuf> {
    let preferred = pipeline_dir.join("pipeline.json");
    if preferred.is_file() {
        return Some(preferred);
    }
    let named = pipeline_dir.join(format!("{}.json", name));
    named.is_file().then_some(named)
}

fn load_metadata(pipeline_dir: &Path, name: &str) -> PipelineMetadata {
    let Some(path) = metadata_path(pipeline_dir, name) else {
        return PipelineMetadata::default();
    };
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                pipeline = name,
                path = %path.display(),
                error = %e,
                "Failed to read metadata file; using defaults"
            );
            return PipelineMetadata::default();
        }
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => PipelineMetadata::from_value(name, &value),
        Err(e) => {
            warn!(
                pipeline = name,
                path = %path.display(),
                error = %e,
                "Malformed metadata JSON; pipeline loads with defaults"
            );
            PipelineMetadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_pipeline(root: &Path, name: &str, entry: &str, metadata: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(entry), "print('hi')\n").unwrap();
        if let Some(json) = metadata {
            fs::write(dir.join("pipeline.json"), json).unwrap();
        }
    }

    fn discovery(root: &Path) -> PipelineDiscovery {
        PipelineDiscovery::new(root, Duration::from_secs(60))
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let result = discovery(Path::new("/nonexistent/fastflow-test")).discover(true);
        assert!(matches!(result, Err(DiscoveryError::RootMissing(_))));
    }

    #[test]
    fn test_scan_filters_invalid_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        make_pipeline(tmp.path(), "good", "main.py", None);
        make_pipeline(tmp.path(), ".hidden", "main.py", None);
        // Directory with no entry file
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        // Stray file at the root
        fs::write(tmp.path().join("README.md"), "readme").unwrap();
        // Notebook type without main.ipynb is skipped
        make_pipeline(
            tmp.path(),
            "nb-missing",
            "main.py",
            Some(r#"{"type": "notebook"}"#),
        );
        // Notebook with its entry file is kept
        make_pipeline(
            tmp.path(),
            "nb-good",
            "main.ipynb",
            Some(r#"{"type": "notebook"}"#),
        );

        let pipelines = discovery(tmp.path()).discover(true).unwrap();
        let names: Vec<&str> = pipelines.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["good", "nb-good"]);
    }

    #[test]
    fn test_malformed_metadata_does_not_hide_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        make_pipeline(tmp.path(), "broken", "main.py", Some("{not json"));
        let pipelines = discovery(tmp.path()).discover(true).unwrap();
        assert_eq!(pipelines.len(), 1);
        assert!(pipelines[0].is_enabled());
        assert_eq!(pipelines[0].metadata, PipelineMetadata::default());
    }

    #[test]
    fn test_pipeline_json_wins_over_named_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("p");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("main.py"), "").unwrap();
        fs::write(dir.join("pipeline.json"), r#"{"description": "from pipeline.json"}"#).unwrap();
        fs::write(dir.join("p.json"), r#"{"description": "from p.json"}"#).unwrap();

        let pipelines = discovery(tmp.path()).discover(true).unwrap();
        assert_eq!(
            pipelines[0].metadata.description.as_deref(),
            Some("from pipeline.json")
        );
    }

    #[test]
    fn test_cache_and_invalidate() {
        let tmp = tempfile::tempdir().unwrap();
        make_pipeline(tmp.path(), "a", "main.py", None);
        let discovery = discovery(tmp.path());

        assert_eq!(discovery.discover(false).unwrap().len(), 1);

        // A new pipeline is invisible until invalidation or force refresh
        make_pipeline(tmp.path(), "b", "main.py", None);
        assert_eq!(discovery.discover(false).unwrap().len(), 1);

        discovery.invalidate();
        assert_eq!(discovery.discover(false).unwrap().len(), 2);
    }

    #[test]
    fn test_set_enabled_rewrites_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        make_pipeline(tmp.path(), "p", "main.py", Some(r#"{"tags": ["keep"]}"#));
        let discovery = discovery(tmp.path());

        discovery.set_enabled("p", false).unwrap();
        let pipeline = discovery.get("p").unwrap().unwrap();
        assert!(!pipeline.is_enabled());
        // Existing keys survive the patch
        assert_eq!(pipeline.metadata.tags, vec!["keep"]);

        discovery.set_enabled("p", true).unwrap();
        assert!(discovery.get("p").unwrap().unwrap().is_enabled());
    }

    #[test]
    fn test_set_webhook_key() {
        let tmp = tempfile::tempdir().unwrap();
        make_pipeline(tmp.path(), "p", "main.py", None);
        let discovery = discovery(tmp.path());

        discovery.set_webhook_key("p", Some("hook-1")).unwrap();
        assert_eq!(
            discovery
                .get("p")
                .unwrap()
                .unwrap()
                .metadata
                .webhook_key
                .as_deref(),
            Some("hook-1")
        );

        // Empty disables webhooks
        discovery.set_webhook_key("p", Some("  ")).unwrap();
        assert!(discovery
            .get("p")
            .unwrap()
            .unwrap()
            .metadata
            .webhook_key
            .is_none());
    }

    #[test]
    fn test_set_enabled_unknown_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let result = discovery(tmp.path()).set_enabled("ghost", true);
        assert!(matches!(result, Err(DiscoveryError::NotFound(_))));
    }
}
