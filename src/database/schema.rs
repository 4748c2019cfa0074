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

//! Diesel schema definitions for the SQLite store.
//!
//! UUIDs are BLOB, timestamps are RFC3339 TEXT, booleans are INTEGER.
//! See the corresponding SQL in `migrations/`.

use diesel::table;

table! {
    pipelines (pipeline_name) {
        pipeline_name -> Text,
        has_requirements -> Integer,
        last_cache_warmup -> Nullable<Text>,
        total_runs -> Integer,
        successful_runs -> Integer,
        failed_runs -> Integer,
        webhook_runs -> Integer,
    }
}

table! {
    pipeline_runs (id) {
        id -> Binary,
        pipeline_name -> Text,
        status -> Text,
        log_file -> Text,
        metrics_file -> Nullable<Text>,
        env_vars -> Text,
        parameters -> Text,
        uv_version -> Nullable<Text>,
        setup_duration -> Nullable<Double>,
        started_at -> Text,
        finished_at -> Nullable<Text>,
        exit_code -> Nullable<BigInt>,
        triggered_by -> Text,
        run_config_id -> Nullable<Text>,
        error_type -> Nullable<Text>,
        error_message -> Nullable<Text>,
        workload_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

table! {
    scheduled_jobs (id) {
        id -> Binary,
        pipeline_name -> Text,
        trigger_type -> Text,
        trigger_value -> Text,
        enabled -> Integer,
        source -> Text,
        kind -> Text,
        start_at -> Nullable<Text>,
        end_at -> Nullable<Text>,
        run_config_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

table! {
    downstream_triggers (id) {
        id -> Binary,
        upstream_pipeline -> Text,
        downstream_pipeline -> Text,
        on_success -> Integer,
        on_failure -> Integer,
        enabled -> Integer,
        created_at -> Text,
    }
}

table! {
    secrets (id) {
        id -> Binary,
        key -> Text,
        value -> Text,
        is_parameter -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

table! {
    orchestrator_settings (id) {
        id -> Integer,
        log_retention_runs -> Nullable<Integer>,
        log_retention_days -> Nullable<Integer>,
        log_max_size_mb -> Nullable<Integer>,
        max_concurrent_runs -> Nullable<Integer>,
        dependency_audit_cron -> Nullable<Text>,
        git_sync_credentials -> Nullable<Text>,
        updated_at -> Text,
    }
}

table! {
    run_cell_logs (run_id, cell_index) {
        run_id -> Binary,
        cell_index -> Integer,
        status -> Text,
        stdout -> Nullable<Text>,
        stderr -> Nullable<Text>,
        outputs -> Nullable<Text>,
        updated_at -> Text,
    }
}
