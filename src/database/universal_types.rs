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

//! Domain type wrappers for SQLite storage.
//!
//! Domain code uses `UniversalUuid`, `UniversalTimestamp` and `UniversalBool`;
//! the DAL converts at its boundary to the SQLite-native representations:
//! UUIDs as BLOB (16 bytes), timestamps as TEXT (RFC3339), booleans as
//! INTEGER (0/1). Keeping Diesel-specific code out of these types means the
//! rest of the crate never sees a storage detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// UUID wrapper stored as a 16-byte BLOB.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct UniversalUuid(pub Uuid);

impl UniversalUuid {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// BLOB representation for inserts.
    pub fn to_blob(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Decodes a BLOB column back into a UUID.
    pub fn from_blob(bytes: &[u8]) -> Result<Self, uuid::Error> {
        Uuid::from_slice(bytes).map(UniversalUuid)
    }
}

impl fmt::Display for UniversalUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UniversalUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<UniversalUuid> for Uuid {
    fn from(wrapper: UniversalUuid) -> Self {
        wrapper.0
    }
}

/// UTC timestamp wrapper stored as RFC3339 TEXT.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniversalTimestamp(pub DateTime<Utc>);

impl UniversalTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// TEXT representation for inserts.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Parses a TEXT column back into a UTC timestamp.
    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| UniversalTimestamp(dt.with_timezone(&Utc)))
    }
}

impl fmt::Display for UniversalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for UniversalTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl From<UniversalTimestamp> for DateTime<Utc> {
    fn from(wrapper: UniversalTimestamp) -> Self {
        wrapper.0
    }
}

/// Current timestamp, as stored.
pub fn current_timestamp() -> UniversalTimestamp {
    UniversalTimestamp::now()
}

/// Current timestamp already encoded for a TEXT column.
pub fn current_timestamp_string() -> String {
    UniversalTimestamp::now().to_rfc3339()
}

/// Boolean wrapper stored as INTEGER 0/1.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct UniversalBool(pub bool);

impl UniversalBool {
    pub fn new(value: bool) -> Self {
        Self(value)
    }

    pub fn is_true(&self) -> bool {
        self.0
    }

    pub fn to_i32(&self) -> i32 {
        if self.0 {
            1
        } else {
            0
        }
    }

    pub fn from_i32(value: i32) -> Self {
        Self(value != 0)
    }
}

impl From<bool> for UniversalBool {
    fn from(value: bool) -> Self {
        Self(value)
    }
}

impl From<UniversalBool> for bool {
    fn from(wrapper: UniversalBool) -> Self {
        wrapper.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_blob_round_trip() {
        let id = UniversalUuid::new_v4();
        let blob = id.to_blob();
        assert_eq!(blob.len(), 16);
        assert_eq!(UniversalUuid::from_blob(&blob).unwrap(), id);
    }

    #[test]
    fn test_uuid_blob_rejects_garbage() {
        assert!(UniversalUuid::from_blob(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_timestamp_round_trip_preserves_instant() {
        let ts = UniversalTimestamp::now();
        let text = ts.to_rfc3339();
        let back = UniversalTimestamp::from_rfc3339(&text).unwrap();
        assert_eq!(ts.0.timestamp_micros(), back.0.timestamp_micros());
    }

    #[test]
    fn test_timestamp_ordering_matches_text_ordering() {
        // Retention queries sort on the TEXT column; RFC3339 in UTC sorts
        // the same as the instant itself.
        let earlier = UniversalTimestamp(Utc::now());
        let later = UniversalTimestamp(earlier.0 + chrono::Duration::seconds(5));
        assert!(earlier < later);
        assert!(earlier.to_rfc3339() < later.to_rfc3339());
    }

    #[test]
    fn test_bool_encoding() {
        assert_eq!(UniversalBool::new(true).to_i32(), 1);
        assert_eq!(UniversalBool::new(false).to_i32(), 0);
        assert!(UniversalBool::from_i32(1).is_true());
        assert!(!UniversalBool::from_i32(0).is_true());
        assert!(UniversalBool::from_i32(7).is_true());
    }
}
