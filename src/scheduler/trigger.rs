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

//! Trigger parsing and next-occurrence math.
//!
//! Cron expressions use the classic 5 fields (minute hour day month
//! day-of-week), evaluated in UTC. Intervals are positive integer seconds.
//! Once triggers are RFC3339 instants that fire a single time.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use croner::Cron;

use crate::error::SchedulerError;
use crate::models::TriggerType;

/// A parsed, validated job trigger.
#[derive(Debug, Clone)]
pub enum JobTrigger {
    Cron(Box<Cron>),
    Interval(u64),
    Once(DateTime<Utc>),
}

impl JobTrigger {
    /// Parses and validates a trigger specification.
    pub fn parse(trigger_type: TriggerType, trigger_value: &str) -> Result<Self, SchedulerError> {
        let invalid = || SchedulerError::InvalidTrigger {
            trigger_type: trigger_type.as_str().to_string(),
            trigger_value: trigger_value.to_string(),
        };

        match trigger_type {
            TriggerType::Cron => {
                // Exactly 5 fields; croner would also accept second-resolution
                if trigger_value.split_whitespace().count() != 5 {
                    return Err(invalid());
                }
                let cron = Cron::new(trigger_value).parse().map_err(|_| invalid())?;
                Ok(JobTrigger::Cron(Box::new(cron)))
            }
            TriggerType::Interval => {
                let seconds: u64 = trigger_value.trim().parse().map_err(|_| invalid())?;
                if seconds == 0 {
                    return Err(invalid());
                }
                Ok(JobTrigger::Interval(seconds))
            }
            TriggerType::Once => {
                let instant = DateTime::parse_from_rfc3339(trigger_value.trim())
                    .map_err(|_| invalid())?
                    .with_timezone(&Utc);
                Ok(JobTrigger::Once(instant))
            }
        }
    }

    /// The first occurrence strictly after `after`; None when the trigger
    /// will never fire again (a once instant in the past).
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobTrigger::Cron(cron) => cron.find_next_occurrence(&after, false).ok(),
            JobTrigger::Interval(seconds) => {
                Some(after + ChronoDuration::seconds(*seconds as i64))
            }
            JobTrigger::Once(instant) => (*instant > after).then_some(*instant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_cron() {
        assert!(JobTrigger::parse(TriggerType::Cron, "0 9 * * *").is_ok());
        assert!(JobTrigger::parse(TriggerType::Cron, "*/5 * * * *").is_ok());
        // Wrong field count
        assert!(JobTrigger::parse(TriggerType::Cron, "0 9 * *").is_err());
        assert!(JobTrigger::parse(TriggerType::Cron, "0 9 * * * *").is_err());
        // Nonsense expression
        assert!(JobTrigger::parse(TriggerType::Cron, "a b c d e").is_err());
    }

    #[test]
    fn test_parse_interval() {
        assert!(JobTrigger::parse(TriggerType::Interval, "300").is_ok());
        assert!(JobTrigger::parse(TriggerType::Interval, "0").is_err());
        assert!(JobTrigger::parse(TriggerType::Interval, "-5").is_err());
        assert!(JobTrigger::parse(TriggerType::Interval, "5m").is_err());
    }

    #[test]
    fn test_parse_once() {
        assert!(JobTrigger::parse(TriggerType::Once, "2030-01-01T09:00:00Z").is_ok());
        assert!(JobTrigger::parse(TriggerType::Once, "next tuesday").is_err());
    }

    #[test]
    fn test_cron_next_occurrence() {
        let trigger = JobTrigger::parse(TriggerType::Cron, "0 9 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let next = trigger.next_occurrence(after).unwrap();
        // 10:00 is past 09:00, so the next fire is tomorrow 09:00
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_next_occurrence() {
        let trigger = JobTrigger::parse(TriggerType::Interval, "60").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        assert_eq!(
            trigger.next_occurrence(after).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 0).unwrap()
        );
    }

    #[test]
    fn test_once_fires_only_in_the_future() {
        let instant = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let trigger = JobTrigger::Once(instant);
        let before = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();
        assert_eq!(trigger.next_occurrence(before), Some(instant));
        assert_eq!(trigger.next_occurrence(after), None);
    }
}
