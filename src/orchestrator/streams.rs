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

//! Log and metric stream pumps for a live run.
//!
//! The log pump re-frames backend byte chunks into lines (chunks may split
//! lines anywhere, including between a server-side timestamp and its
//! content), filters the setup-ready sentinel and the notebook cell
//! protocol, prefixes each surviving line with a UTC timestamp, appends to
//! the run's log file, and fans out to the SSE broadcast queue. Overflowing
//! subscribers lose the oldest entries, never the newest.
//!
//! The metric pump writes one JSON line per sample, evaluates soft limits,
//! and notifies at most once per run when a soft limit is first exceeded.

use std::path::Path;

use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::dal::DAL;
use crate::database::universal_types::UniversalUuid;
use crate::executor::types::{memory_limit_mb, ResourceLimits, SETUP_READY_MARKER};
use crate::executor::{LogStream, MetricStream};

use super::cell_protocol;

/// Re-frames arbitrary byte chunks into complete lines.
#[derive(Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk; returns every now-complete line, decoded lossily.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            lines.push(text);
        }
        lines
    }

    /// The final unterminated line, if any.
    pub fn finish(mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buffer).to_string();
        self.buffer.clear();
        Some(text)
    }
}

/// Strips a leading RFC3339 timestamp token (Kubernetes `timestamps=true`
/// log framing). Returns the line unchanged when no timestamp leads it.
pub fn strip_leading_timestamp(line: &str) -> &str {
    let Some((token, rest)) = line.split_once(' ') else {
        // A bare timestamp line carries no content
        return if chrono::DateTime::parse_from_rfc3339(line).is_ok() {
            ""
        } else {
            line
        };
    };
    if chrono::DateTime::parse_from_rfc3339(token).is_ok() {
        rest
    } else {
        line
    }
}

/// Unwraps a Docker json-file log record (`{"log": "...", ...}`); any other
/// line passes through untouched.
pub fn unwrap_json_log_line(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(log) = value.get("log").and_then(|v| v.as_str()) {
                return log.trim_end().to_string();
            }
        }
    }
    line.to_string()
}

/// Human log line timestamp: `YYYY-MM-DD HH:MM:SS.mmm` (UTC).
pub fn format_log_line(text: &str) -> String {
    format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), text)
}

/// Configuration for one log pump.
pub struct LogPumpOptions {
    /// Strip server-side timestamps (Kubernetes log framing)
    pub strip_timestamps: bool,
    /// Parse and persist the notebook cell protocol
    pub notebook: bool,
    /// Stop persisting once the file exceeds this size
    pub max_size_mb: Option<u64>,
}

/// Pumps a backend log stream to the run's log file and SSE queue.
///
/// Returns once the stream ends (workload exit) or the size cap is hit.
/// The `setup_ready` channel fires when the sentinel is consumed; the
/// sentinel itself never reaches the log.
pub async fn pump_logs(
    mut stream: LogStream,
    log_path: &Path,
    queue: broadcast::Sender<String>,
    mut setup_ready: Option<oneshot::Sender<()>>,
    dal: DAL,
    run_id: UniversalUuid,
    options: LogPumpOptions,
) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;

    let mut decoder = LineDecoder::new();
    let mut line_count: u64 = 0;
    let mut last_size_check = tokio::time::Instant::now();
    let mut capped = false;

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Log stream error; stopping pump");
                break;
            }
        };
        for line in decoder.push(&chunk) {
            if process_line(
                &line,
                &mut file,
                &queue,
                &mut setup_ready,
                &dal,
                run_id,
                &options,
            )
            .await?
            {
                line_count += 1;
            }

            // Spam guard: check the file size every 1000 lines or 10 seconds
            if let Some(cap_mb) = options.max_size_mb {
                if line_count % 1000 == 0 || last_size_check.elapsed().as_secs() > 10 {
                    last_size_check = tokio::time::Instant::now();
                    if let Ok(meta) = tokio::fs::metadata(log_path).await {
                        if meta.len() > cap_mb * 1024 * 1024 {
                            warn!(
                                run_id = %run_id,
                                cap_mb,
                                "Log file exceeds the size cap; stopping persistence"
                            );
                            capped = true;
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    if !capped {
        if let Some(line) = decoder.finish() {
            process_line(
                &line,
                &mut file,
                &queue,
                &mut setup_ready,
                &dal,
                run_id,
                &options,
            )
            .await?;
        }
    }

    file.flush().await?;
    debug!(run_id = %run_id, lines = line_count, "Log pump finished");
    Ok(())
}

/// Handles one framed line; returns whether something was written.
async fn process_line(
    raw: &str,
    file: &mut tokio::fs::File,
    queue: &broadcast::Sender<String>,
    setup_ready: &mut Option<oneshot::Sender<()>>,
    dal: &DAL,
    run_id: UniversalUuid,
    options: &LogPumpOptions,
) -> std::io::Result<bool> {
    let stripped = if options.strip_timestamps {
        strip_leading_timestamp(raw)
    } else {
        raw
    };
    let line = unwrap_json_log_line(stripped);
    if line.is_empty() {
        return Ok(false);
    }

    // The sentinel marks user-code start; it is consumed, never logged
    if line.trim() == SETUP_READY_MARKER {
        if let Some(sender) = setup_ready.take() {
            let _ = sender.send(());
        }
        return Ok(false);
    }

    let to_write = if options.notebook && cell_protocol::is_cell_line(&line) {
        if let Some(parsed) = cell_protocol::parse(&line) {
            cell_protocol::persist(dal, run_id, &parsed).await;
        }
        match cell_protocol::readable_log_line(&line) {
            Some(readable) => readable,
            // OUTPUT lines are persisted per cell only
            None => return Ok(false),
        }
    } else {
        line
    };

    let stamped = format_log_line(&to_write);
    file.write_all(stamped.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    // Send failures just mean nobody is subscribed right now
    let _ = queue.send(stamped);
    Ok(true)
}

/// One metrics-file record; unknown values serialise as null rather than
/// masquerading as zero.
#[derive(serde::Serialize)]
struct MetricRecord {
    timestamp: String,
    cpu_percent: Option<f64>,
    ram_mb: Option<f64>,
    ram_limit_mb: Option<f64>,
    soft_limit_exceeded: bool,
}

/// A soft-limit breach observed by the metric pump.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftLimitBreach {
    pub resource: &'static str,
    pub observed: f64,
    pub limit: f64,
}

/// Pumps backend metric samples to the run's metrics file and SSE queue.
///
/// Evaluates soft limits per sample; the first breach is reported through
/// `on_breach` exactly once for the whole run.
pub async fn pump_metrics(
    mut stream: MetricStream,
    metrics_path: &Path,
    queue: broadcast::Sender<String>,
    limits: ResourceLimits,
    mut on_breach: impl FnMut(SoftLimitBreach),
) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(metrics_path)
        .await?;

    let cpu_soft_percent = limits.cpu_soft_limit.map(|cores| cores * 100.0);
    let mem_soft_mb = limits.mem_soft_limit.as_deref().and_then(memory_limit_mb);
    let mut breach_reported = false;

    while let Some(sample) = stream.next().await {
        let mut breach = None;
        if let (Some(limit), Some(cpu)) = (cpu_soft_percent, sample.cpu_percent) {
            if cpu > limit {
                breach = Some(SoftLimitBreach {
                    resource: "CPU",
                    observed: cpu,
                    limit,
                });
            }
        }
        if breach.is_none() {
            if let (Some(limit), Some(ram)) = (mem_soft_mb, sample.ram_mb) {
                if ram > limit {
                    breach = Some(SoftLimitBreach {
                        resource: "RAM",
                        observed: ram,
                        limit,
                    });
                }
            }
        }

        let record = MetricRecord {
            timestamp: sample.timestamp.to_rfc3339(),
            cpu_percent: sample.cpu_percent,
            ram_mb: sample.ram_mb,
            ram_limit_mb: sample.ram_limit_mb,
            soft_limit_exceeded: breach.is_some(),
        };
        let encoded = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(encoded.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        let _ = queue.send(encoded);

        if let Some(breach) = breach {
            if !breach_reported {
                breach_reported = true;
                on_breach(breach);
            }
        }
    }

    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_decoder_handles_chunk_boundaries() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"hel").is_empty());
        assert_eq!(decoder.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(decoder.push(b"ld\n"), vec!["world"]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_line_decoder_multiple_lines_per_chunk() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"a\nb\nc"), vec!["a", "b"]);
        assert_eq!(decoder.finish().as_deref(), Some("c"));
    }

    #[test]
    fn test_line_decoder_strips_carriage_returns() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"line\r\n"), vec!["line"]);
    }

    #[test]
    fn test_strip_leading_timestamp() {
        assert_eq!(
            strip_leading_timestamp("2025-06-01T12:00:00.123456789Z hello"),
            "hello"
        );
        assert_eq!(strip_leading_timestamp("no timestamp here"), "no timestamp here");
        // A chunk boundary can leave a bare timestamp on its own line
        assert_eq!(strip_leading_timestamp("2025-06-01T12:00:00Z"), "");
        // Content that merely resembles a date is untouched
        assert_eq!(strip_leading_timestamp("2025-06-01 started"), "2025-06-01 started");
    }

    #[test]
    fn test_unwrap_json_log_line() {
        assert_eq!(
            unwrap_json_log_line(r#"{"log":"payload\n","stream":"stdout"}"#),
            "payload"
        );
        assert_eq!(unwrap_json_log_line("plain"), "plain");
        // Malformed JSON passes through
        assert_eq!(unwrap_json_log_line("{not json"), "{not json");
    }

    #[test]
    fn test_format_log_line_shape() {
        let line = format_log_line("hi");
        // [YYYY-MM-DD HH:MM:SS.mmm] hi
        assert!(line.starts_with('['));
        assert!(line.ends_with("] hi"));
        let stamp = &line[1..line.len() - 4];
        assert_eq!(stamp.len(), "2025-06-01 12:00:00.123".len());
    }
}
