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

//! Domain models for the entities persisted in the relational store.
//!
//! These are storage-agnostic types; the DAL converts them to and from the
//! SQLite row representation at its boundary.

pub mod cell_log;
pub mod downstream_trigger;
pub mod pipeline;
pub mod pipeline_run;
pub mod scheduled_job;
pub mod secret;
pub mod settings;

pub use cell_log::{CellStatus, RunCellLog};
pub use downstream_trigger::{DownstreamTrigger, NewDownstreamTrigger};
pub use pipeline::Pipeline;
pub use pipeline_run::{NewPipelineRun, PipelineRun, RunStatus};
pub use scheduled_job::{JobKind, JobSource, NewScheduledJob, ScheduledJob, TriggerType};
pub use secret::{validate_secret_key, NewSecret, Secret};
pub use settings::OrchestratorSettings;
