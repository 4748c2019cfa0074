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

//! Notebook cell protocol.
//!
//! The in-container notebook runner reports progress as tab-delimited stdout
//! lines:
//!
//! ```text
//! FASTFLOW_CELL_START\t<index>
//! FASTFLOW_CELL_END\t<index>\tSUCCESS
//! FASTFLOW_CELL_END\t<index>\tRETRYING\t<attempt>\t<error>
//! FASTFLOW_CELL_END\t<index>\tFAILED
//! FASTFLOW_CELL_OUTPUT\t<index>\t<stream>\t<encoding>\t<payload>
//! FASTFLOW_CELL_OUTPUT\t<index>\timage\t<mime>\t<base64>
//! ```
//!
//! The orchestrator parses these out of the log stream, persists them per
//! cell, and writes a condensed human-readable form into the run log
//! (OUTPUT lines stay out of the log; their content lives in the cell UI).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use crate::dal::DAL;
use crate::database::universal_types::UniversalUuid;
use crate::models::CellStatus;

pub const PREFIX_CELL_START: &str = "FASTFLOW_CELL_START\t";
pub const PREFIX_CELL_END: &str = "FASTFLOW_CELL_END\t";
pub const PREFIX_CELL_OUTPUT: &str = "FASTFLOW_CELL_OUTPUT\t";

/// A parsed cell protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum CellLine {
    Start {
        index: i32,
    },
    End {
        index: i32,
        status: CellEndStatus,
    },
    Output {
        index: i32,
        output: CellOutput,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellEndStatus {
    Success,
    Failed,
    Retrying { attempt: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellOutput {
    Stream {
        stderr: bool,
        /// Already decoded (base64 payloads are unwrapped at parse time)
        text: String,
    },
    Image {
        mime: String,
        data_base64: String,
    },
}

/// True when the line belongs to the cell protocol.
pub fn is_cell_line(line: &str) -> bool {
    line.starts_with(PREFIX_CELL_START)
        || line.starts_with(PREFIX_CELL_END)
        || line.starts_with(PREFIX_CELL_OUTPUT)
}

/// Parses a protocol line; None for anything malformed.
pub fn parse(line: &str) -> Option<CellLine> {
    if let Some(rest) = line.strip_prefix(PREFIX_CELL_START) {
        let index = rest.trim().parse().ok()?;
        return Some(CellLine::Start { index });
    }

    if let Some(rest) = line.strip_prefix(PREFIX_CELL_END) {
        let mut parts = rest.splitn(3, '\t');
        let index: i32 = parts.next()?.trim().parse().ok()?;
        let status = match parts.next()?.trim().to_uppercase().as_str() {
            "SUCCESS" => CellEndStatus::Success,
            "FAILED" => CellEndStatus::Failed,
            "RETRYING" => {
                let detail = parts.next().unwrap_or("");
                let mut detail_parts = detail.splitn(2, '\t');
                CellEndStatus::Retrying {
                    attempt: detail_parts.next().unwrap_or("?").trim().to_string(),
                    error: detail_parts.next().unwrap_or("").trim().to_string(),
                }
            }
            _ => return None,
        };
        return Some(CellLine::End { index, status });
    }

    if let Some(rest) = line.strip_prefix(PREFIX_CELL_OUTPUT) {
        let mut parts = rest.splitn(4, '\t');
        let index: i32 = parts.next()?.trim().parse().ok()?;
        let stream = parts.next()?;
        let third = parts.next()?;
        let payload = parts.next().unwrap_or("");

        let output = match stream {
            "stdout" | "stderr" => {
                let text = match third {
                    "base64" => match BASE64.decode(payload) {
                        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                        Err(_) => String::new(),
                    },
                    // "text" payloads escape tabs as \t
                    _ => payload.replace("\\t", "\t"),
                };
                CellOutput::Stream {
                    stderr: stream == "stderr",
                    text,
                }
            }
            "image" => CellOutput::Image {
                mime: third.to_string(),
                data_base64: payload.to_string(),
            },
            _ => return None,
        };
        return Some(CellLine::Output { index, output });
    }

    None
}

/// Condensed human-readable form for the run log.
///
/// OUTPUT lines return None (their content is persisted per cell, not
/// duplicated into the log).
pub fn readable_log_line(line: &str) -> Option<String> {
    match parse(line)? {
        CellLine::Start { index } => Some(format!("[Notebook] Cell {}: started", index)),
        CellLine::End { index, status } => match status {
            CellEndStatus::Success => Some(format!("[Notebook] Cell {}: success", index)),
            CellEndStatus::Failed => Some(format!("[Notebook] Cell {}: failed", index)),
            CellEndStatus::Retrying { attempt, error } => {
                let mut truncated = error;
                truncated.truncate(150);
                if truncated.is_empty() {
                    Some(format!("[Notebook] Cell {}: retry attempt {}", index, attempt))
                } else {
                    Some(format!(
                        "[Notebook] Cell {}: retry attempt {} ({})",
                        index, attempt, truncated
                    ))
                }
            }
        },
        CellLine::Output { .. } => None,
    }
}

/// Persists one parsed protocol line into the per-cell records.
pub async fn persist(dal: &DAL, run_id: UniversalUuid, line: &CellLine) {
    let result = match line {
        CellLine::Start { index } => {
            dal.cell_log()
                .upsert_status(run_id, *index, CellStatus::Running)
                .await
        }
        CellLine::End { index, status } => match status {
            CellEndStatus::Success => {
                dal.cell_log()
                    .upsert_status(run_id, *index, CellStatus::Success)
                    .await
            }
            CellEndStatus::Failed => {
                let update = dal
                    .cell_log()
                    .upsert_status(run_id, *index, CellStatus::Failed)
                    .await;
                if update.is_ok() {
                    dal.cell_log()
                        .append_stream(run_id, *index, true, "--- failed permanently ---\n")
                        .await
                } else {
                    update
                }
            }
            CellEndStatus::Retrying { attempt, error } => {
                let update = dal
                    .cell_log()
                    .upsert_status(run_id, *index, CellStatus::Retrying)
                    .await;
                if update.is_ok() {
                    let note = format!("--- retry attempt {} failed ---\n{}\n\n", attempt, error);
                    dal.cell_log()
                        .append_stream(run_id, *index, true, &note)
                        .await
                } else {
                    update
                }
            }
        },
        CellLine::Output { index, output } => match output {
            CellOutput::Stream { stderr, text } => {
                let mut text = text.clone();
                text.push('\n');
                dal.cell_log()
                    .append_stream(run_id, *index, *stderr, &text)
                    .await
            }
            CellOutput::Image { mime, data_base64 } => {
                dal.cell_log()
                    .append_image(run_id, *index, mime, data_base64)
                    .await
            }
        },
    };

    if let Err(e) = result {
        warn!(run_id = %run_id, error = %e, "Failed to persist cell log line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        assert_eq!(
            parse("FASTFLOW_CELL_START\t3"),
            Some(CellLine::Start { index: 3 })
        );
        assert_eq!(parse("FASTFLOW_CELL_START\tnope"), None);
    }

    #[test]
    fn test_parse_end_variants() {
        assert_eq!(
            parse("FASTFLOW_CELL_END\t0\tSUCCESS"),
            Some(CellLine::End {
                index: 0,
                status: CellEndStatus::Success
            })
        );
        assert_eq!(
            parse("FASTFLOW_CELL_END\t2\tFAILED"),
            Some(CellLine::End {
                index: 2,
                status: CellEndStatus::Failed
            })
        );
        assert_eq!(
            parse("FASTFLOW_CELL_END\t1\tRETRYING\t2\tdivision by zero"),
            Some(CellLine::End {
                index: 1,
                status: CellEndStatus::Retrying {
                    attempt: "2".to_string(),
                    error: "division by zero".to_string()
                }
            })
        );
    }

    #[test]
    fn test_parse_output_text_and_base64() {
        assert_eq!(
            parse("FASTFLOW_CELL_OUTPUT\t0\tstdout\ttext\thello\\tworld"),
            Some(CellLine::Output {
                index: 0,
                output: CellOutput::Stream {
                    stderr: false,
                    text: "hello\tworld".to_string()
                }
            })
        );

        let encoded = BASE64.encode("multi\nline");
        assert_eq!(
            parse(&format!("FASTFLOW_CELL_OUTPUT\t1\tstderr\tbase64\t{}", encoded)),
            Some(CellLine::Output {
                index: 1,
                output: CellOutput::Stream {
                    stderr: true,
                    text: "multi\nline".to_string()
                }
            })
        );
    }

    #[test]
    fn test_parse_output_image() {
        assert_eq!(
            parse("FASTFLOW_CELL_OUTPUT\t2\timage\timage/png\tAAAA"),
            Some(CellLine::Output {
                index: 2,
                output: CellOutput::Image {
                    mime: "image/png".to_string(),
                    data_base64: "AAAA".to_string()
                }
            })
        );
    }

    #[test]
    fn test_readable_log_lines() {
        assert_eq!(
            readable_log_line("FASTFLOW_CELL_START\t0").as_deref(),
            Some("[Notebook] Cell 0: started")
        );
        assert_eq!(
            readable_log_line("FASTFLOW_CELL_END\t0\tSUCCESS").as_deref(),
            Some("[Notebook] Cell 0: success")
        );
        assert_eq!(
            readable_log_line("FASTFLOW_CELL_END\t1\tRETRYING\t2\tboom").as_deref(),
            Some("[Notebook] Cell 1: retry attempt 2 (boom)")
        );
        // OUTPUT lines never reach the run log
        assert_eq!(
            readable_log_line("FASTFLOW_CELL_OUTPUT\t0\tstdout\ttext\thi"),
            None
        );
        assert_eq!(readable_log_line("ordinary line"), None);
    }

    #[test]
    fn test_is_cell_line() {
        assert!(is_cell_line("FASTFLOW_CELL_START\t0"));
        assert!(is_cell_line("FASTFLOW_CELL_OUTPUT\t0\tstdout\ttext\tx"));
        assert!(!is_cell_line("FASTFLOW_SETUP_READY"));
        assert!(!is_cell_line("plain output"));
    }
}
