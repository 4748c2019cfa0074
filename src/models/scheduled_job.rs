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

//! Scheduled job records.
//!
//! Jobs persist in the relational store so schedules survive restarts. Jobs
//! sourced from `pipeline_json` are reconciled against pipeline metadata on
//! every discovery refresh; api-sourced jobs are preserved untouched.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};

/// Trigger kind for a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    /// 5-field cron expression (minute hour day month day-of-week)
    Cron,
    /// Fixed interval in seconds
    Interval,
    /// One-shot fire at an RFC3339 instant
    Once,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Cron => "CRON",
            TriggerType::Interval => "INTERVAL",
            TriggerType::Once => "ONCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRON" => Some(TriggerType::Cron),
            "INTERVAL" => Some(TriggerType::Interval),
            "ONCE" => Some(TriggerType::Once),
            _ => None,
        }
    }
}

/// What a scheduled job does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Submit a run (`triggered_by = "scheduler"`)
    Submit,
    /// Cancel the running daemon and submit afresh
    /// (`triggered_by = "daemon_restart"`)
    DaemonRestart,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Submit => "submit",
            JobKind::DaemonRestart => "daemon_restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submit" => Some(JobKind::Submit),
            "daemon_restart" => Some(JobKind::DaemonRestart),
            _ => None,
        }
    }
}

/// Where a scheduled job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobSource {
    /// Created through the control-plane API; never touched by reconciliation
    Api,
    /// Generated from pipeline metadata; replaced on every discovery refresh
    PipelineJson,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Api => "api",
            JobSource::PipelineJson => "pipeline_json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(JobSource::Api),
            "pipeline_json" => Some(JobSource::PipelineJson),
            _ => None,
        }
    }
}

/// A persisted schedule entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: UniversalUuid,
    pub pipeline_name: String,
    pub trigger_type: TriggerType,
    /// Cron expression or integer seconds, per `trigger_type`
    pub trigger_value: String,
    pub enabled: bool,
    pub source: JobSource,
    pub kind: JobKind,
    /// Optional active window start
    pub start_at: Option<UniversalTimestamp>,
    /// Optional active window end
    pub end_at: Option<UniversalTimestamp>,
    /// Named schedule to apply to triggered runs
    pub run_config_id: Option<String>,
    pub created_at: UniversalTimestamp,
    pub updated_at: UniversalTimestamp,
}

/// Fields required to create a new scheduled job.
#[derive(Debug, Clone)]
pub struct NewScheduledJob {
    pub pipeline_name: String,
    pub trigger_type: TriggerType,
    pub trigger_value: String,
    pub enabled: bool,
    pub source: JobSource,
    pub kind: JobKind,
    pub start_at: Option<UniversalTimestamp>,
    pub end_at: Option<UniversalTimestamp>,
    pub run_config_id: Option<String>,
}
