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

//! Workload command construction.
//!
//! Every run executes `uv run --python <version>` with the pipeline source
//! mounted at `/app`. When a pinned lock file exists it is preferred over the
//! raw manifest so the managed-environment cache is hit. Script pipelines run
//! a `python -c` wrapper that prints the setup-ready sentinel and then
//! executes `/app/main.py` as `__main__`; the notebook runner prints the
//! sentinel itself.

use std::collections::HashMap;

use crate::discovery::EntryType;

use super::types::WorkloadSpec;

/// Wrapper passed to `python -c` for script pipelines: sentinel first, then
/// main.py with script semantics (cwd `/app`, argv, `__name__ == "__main__"`).
pub const SETUP_READY_WRAPPER: &str = "print('FASTFLOW_SETUP_READY', flush=True); \
import os, sys, runpy; \
os.chdir('/app'); \
sys.argv = ['main.py']; \
runpy.run_path('/app/main.py', run_name='__main__')";

/// In-container paths, identical on both backends.
pub const APP_MOUNT: &str = "/app";
pub const RUNNER_MOUNT: &str = "/runner";
pub const UV_CACHE_MOUNT: &str = "/root/.cache/uv";
pub const UV_PYTHON_MOUNT: &str = "/cache/uv_python";
pub const LOCK_FILE_PATH: &str = "/app/requirements.txt.lock";
pub const REQUIREMENTS_PATH: &str = "/app/requirements.txt";

/// Builds the command line for a workload.
pub fn build_command(spec: &WorkloadSpec) -> Vec<String> {
    let mut command = vec![
        "uv".to_string(),
        "run".to_string(),
        "--python".to_string(),
        spec.python_version.clone(),
    ];

    if spec.has_requirements {
        command.push("--with-requirements".to_string());
        command.push(if spec.has_lock_file {
            LOCK_FILE_PATH.to_string()
        } else {
            // Pre-heat has not produced a lock yet; resolve from the manifest
            REQUIREMENTS_PATH.to_string()
        });
    }

    match spec.entry_type {
        EntryType::Script => {
            command.push("python".to_string());
            command.push("-u".to_string());
            command.push("-c".to_string());
            command.push(SETUP_READY_WRAPPER.to_string());
        }
        EntryType::Notebook => {
            command.push("python".to_string());
            command.push("-u".to_string());
            command.push("/runner/nb_runner.py".to_string());
            command.push("/app/main.ipynb".to_string());
        }
    }

    command
}

/// The fixed base environment every workload receives. Applied last in the
/// resolution order, so callers cannot break the uv cache wiring.
pub fn base_env() -> HashMap<String, String> {
    HashMap::from([
        ("UV_CACHE_DIR".to_string(), UV_CACHE_MOUNT.to_string()),
        ("UV_PYTHON_INSTALL_DIR".to_string(), UV_PYTHON_MOUNT.to_string()),
        ("UV_LINK_MODE".to_string(), "copy".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::types::ResourceLimits;
    use std::path::PathBuf;

    fn spec(entry_type: EntryType, has_requirements: bool, has_lock_file: bool) -> WorkloadSpec {
        WorkloadSpec {
            run_id: uuid::Uuid::new_v4(),
            pipeline_name: "p".to_string(),
            pipeline_path: PathBuf::from("/pipelines/p"),
            entry_type,
            python_version: "3.12".to_string(),
            has_requirements,
            has_lock_file,
            env: Default::default(),
            limits: ResourceLimits::default(),
            timeout: None,
        }
    }

    #[test]
    fn test_script_without_requirements() {
        let command = build_command(&spec(EntryType::Script, false, false));
        assert_eq!(
            &command[..4],
            &["uv", "run", "--python", "3.12"].map(String::from)
        );
        assert_eq!(command[4], "python");
        assert_eq!(command[5], "-u");
        assert_eq!(command[6], "-c");
        assert!(command[7].starts_with("print('FASTFLOW_SETUP_READY'"));
        assert!(command[7].contains("runpy.run_path('/app/main.py'"));
    }

    #[test]
    fn test_script_prefers_lock_file() {
        let command = build_command(&spec(EntryType::Script, true, true));
        let position = command
            .iter()
            .position(|c| c == "--with-requirements")
            .unwrap();
        assert_eq!(command[position + 1], LOCK_FILE_PATH);
    }

    #[test]
    fn test_script_falls_back_to_manifest() {
        let command = build_command(&spec(EntryType::Script, true, false));
        let position = command
            .iter()
            .position(|c| c == "--with-requirements")
            .unwrap();
        assert_eq!(command[position + 1], REQUIREMENTS_PATH);
    }

    #[test]
    fn test_notebook_uses_runner() {
        let command = build_command(&spec(EntryType::Notebook, true, true));
        assert!(command.contains(&"/runner/nb_runner.py".to_string()));
        assert!(command.contains(&"/app/main.ipynb".to_string()));
        // The runner prints the sentinel itself; no -c wrapper
        assert!(!command.iter().any(|c| c.contains("runpy")));
    }

    #[test]
    fn test_base_env_pins_uv_wiring() {
        let env = base_env();
        assert_eq!(env.get("UV_CACHE_DIR").unwrap(), UV_CACHE_MOUNT);
        assert_eq!(env.get("UV_LINK_MODE").unwrap(), "copy");
        assert_eq!(env.get("PYTHONUNBUFFERED").unwrap(), "1");
    }
}
