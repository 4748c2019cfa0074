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

//! Retry strategy evaluation for failed pipeline runs.
//!
//! A strategy is declared in pipeline metadata as a tagged object; `delay`
//! is a pure function from (attempt index, strategy) to seconds. Attempts
//! are 1-based: the first retry is attempt 1.
//!
//! Retries apply to script pipelines only; notebook pipelines retry per cell
//! inside the same run.

use serde::{Deserialize, Serialize};

/// Declared retry strategy, from the `retry_strategy` metadata key.
///
/// An unknown `type` is rejected at metadata load time and treated as no
/// strategy (the default delay applies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay before every retry.
    FixedDelay {
        /// Seconds; falls back to the default when absent
        delay: Option<u64>,
    },
    /// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`.
    ExponentialBackoff {
        #[serde(default = "default_initial_delay")]
        initial_delay: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_delay")]
        max_delay: u64,
    },
    /// Explicit per-attempt delays; the last entry repeats when attempts
    /// outnumber entries.
    CustomSchedule {
        #[serde(default)]
        delays: Vec<u64>,
    },
}

fn default_initial_delay() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    3600
}

/// Computes the delay in seconds before retry `attempt` (1-based).
///
/// - `None` strategy: `default_seconds`
/// - fixed_delay: its `delay`, or `default_seconds` when unset
/// - exponential_backoff: `min(initial * multiplier^(attempt-1), max_delay)`
/// - custom_schedule: `delays[attempt-1]`, last entry reused past the end;
///   an empty list yields `default_seconds`
pub fn delay(attempt: u32, strategy: Option<&RetryStrategy>, default_seconds: u64) -> u64 {
    debug_assert!(attempt >= 1, "attempt is 1-based");
    match strategy {
        None => default_seconds,
        Some(RetryStrategy::FixedDelay { delay }) => delay.unwrap_or(default_seconds),
        Some(RetryStrategy::ExponentialBackoff {
            initial_delay,
            multiplier,
            max_delay,
        }) => {
            let raw = (*initial_delay as f64) * multiplier.powi(attempt.saturating_sub(1) as i32);
            if raw.is_finite() && raw < *max_delay as f64 {
                raw as u64
            } else {
                *max_delay
            }
        }
        Some(RetryStrategy::CustomSchedule { delays }) => {
            if delays.is_empty() {
                return default_seconds;
            }
            let index = (attempt as usize - 1).min(delays.len() - 1);
            delays[index]
        }
    }
}

/// Sleeps for the computed retry delay.
pub async fn wait_for_retry(attempt: u32, strategy: Option<&RetryStrategy>, default_seconds: u64) {
    let seconds = delay(attempt, strategy, default_seconds);
    tracing::info!(
        attempt,
        delay_seconds = seconds,
        "Waiting before retry attempt"
    );
    tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_strategy_uses_default() {
        assert_eq!(delay(1, None, 60), 60);
        assert_eq!(delay(5, None, 10), 10);
    }

    #[test]
    fn test_fixed_delay() {
        let strategy = RetryStrategy::FixedDelay { delay: Some(5) };
        assert_eq!(delay(1, Some(&strategy), 60), 5);
        assert_eq!(delay(3, Some(&strategy), 60), 5);

        let unset = RetryStrategy::FixedDelay { delay: None };
        assert_eq!(delay(1, Some(&unset), 60), 60);
    }

    #[test]
    fn test_exponential_backoff() {
        let strategy = RetryStrategy::ExponentialBackoff {
            initial_delay: 60,
            multiplier: 2.0,
            max_delay: 3600,
        };
        assert_eq!(delay(1, Some(&strategy), 0), 60);
        assert_eq!(delay(2, Some(&strategy), 0), 120);
        assert_eq!(delay(3, Some(&strategy), 0), 240);
        // 60 * 2^6 = 3840 > 3600 cap
        assert_eq!(delay(7, Some(&strategy), 0), 3600);
        // far past the cap stays at the cap
        assert_eq!(delay(30, Some(&strategy), 0), 3600);
    }

    #[test]
    fn test_exponential_backoff_law() {
        let initial = 10u64;
        let multiplier = 3.0f64;
        let max = 1000u64;
        let strategy = RetryStrategy::ExponentialBackoff {
            initial_delay: initial,
            multiplier,
            max_delay: max,
        };
        for attempt in 1..=10u32 {
            let expected =
                ((initial as f64) * multiplier.powi(attempt as i32 - 1)).min(max as f64) as u64;
            assert_eq!(delay(attempt, Some(&strategy), 0), expected);
        }
    }

    #[test]
    fn test_custom_schedule() {
        let strategy = RetryStrategy::CustomSchedule {
            delays: vec![1, 5, 30],
        };
        assert_eq!(delay(1, Some(&strategy), 60), 1);
        assert_eq!(delay(2, Some(&strategy), 60), 5);
        assert_eq!(delay(3, Some(&strategy), 60), 30);
        // last delay reused when attempts outnumber entries
        assert_eq!(delay(4, Some(&strategy), 60), 30);
        assert_eq!(delay(99, Some(&strategy), 60), 30);
    }

    #[test]
    fn test_custom_schedule_empty() {
        let strategy = RetryStrategy::CustomSchedule { delays: vec![] };
        assert_eq!(delay(1, Some(&strategy), 60), 60);
    }

    #[test]
    fn test_deserialization() {
        let fixed: RetryStrategy =
            serde_json::from_str(r#"{"type": "fixed_delay", "delay": 1}"#).unwrap();
        assert_eq!(fixed, RetryStrategy::FixedDelay { delay: Some(1) });

        let exp: RetryStrategy =
            serde_json::from_str(r#"{"type": "exponential_backoff"}"#).unwrap();
        assert_eq!(
            exp,
            RetryStrategy::ExponentialBackoff {
                initial_delay: 60,
                multiplier: 2.0,
                max_delay: 3600,
            }
        );

        let custom: RetryStrategy =
            serde_json::from_str(r#"{"type": "custom_schedule", "delays": [2, 4]}"#).unwrap();
        assert_eq!(custom, RetryStrategy::CustomSchedule { delays: vec![2, 4] });

        // unknown type fails to parse; metadata loading maps that to None
        assert!(serde_json::from_str::<RetryStrategy>(r#"{"type": "quadratic"}"#).is_err());
    }
}
