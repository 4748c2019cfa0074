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

//! Stored secrets and plaintext parameters.
//!
//! A row with `is_parameter = false` holds a vault ciphertext; with
//! `is_parameter = true` the value is stored verbatim. The two are merged
//! into the run environment the same way.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::error::VaultError;

/// A stored secret or parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: UniversalUuid,
    /// Unique key; `/` is allowed for namespacing ("env/DATABASE_URL")
    pub key: String,
    /// Ciphertext (base64) or plaintext when `is_parameter`
    pub value: String,
    pub is_parameter: bool,
    pub created_at: UniversalTimestamp,
    pub updated_at: UniversalTimestamp,
}

#[derive(Debug, Clone)]
pub struct NewSecret {
    pub key: String,
    pub value: String,
    pub is_parameter: bool,
}

/// Validates a secret key at the API boundary.
///
/// Keys are restricted to `[A-Za-z0-9_/-]`, must not contain `..`, and must
/// be 1-255 characters long.
pub fn validate_secret_key(key: &str) -> Result<(), VaultError> {
    if key.is_empty() || key.len() > 255 {
        return Err(VaultError::InvalidSecretKey(format!(
            "key length must be 1-255 characters, got {}",
            key.len()
        )));
    }
    if key.contains("..") {
        return Err(VaultError::InvalidSecretKey(
            "key must not contain '..'".to_string(),
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '-')
    {
        return Err(VaultError::InvalidSecretKey(format!(
            "key contains invalid characters: {:?}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert!(validate_secret_key("DATABASE_URL").is_ok());
        assert!(validate_secret_key("env/DATABASE_URL").is_ok());
        assert!(validate_secret_key("a-b_c/d-1").is_ok());
        assert!(validate_secret_key("x").is_ok());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(validate_secret_key("").is_err());
        assert!(validate_secret_key(&"k".repeat(256)).is_err());
        assert!(validate_secret_key("has space").is_err());
        assert!(validate_secret_key("dot.dot").is_err());
        assert!(validate_secret_key("a/../b").is_err());
        assert!(validate_secret_key("ümlaut").is_err());
    }

    #[test]
    fn test_255_char_key_allowed() {
        assert!(validate_secret_key(&"k".repeat(255)).is_ok());
    }
}
