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

//! AES-256-GCM secrets vault.
//!
//! Secret values are stored encrypted; the wire format is
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`, base64-encoded for the
//! TEXT column. Encryption is randomised (fresh nonce per call), so equal
//! plaintexts produce different ciphertexts.
//!
//! The process-wide key comes from `ENCRYPTION_KEY` (base64, 32 bytes).
//! Absence is fatal in production and a warning in development.

use std::collections::HashMap;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::dal::DAL;
use crate::error::VaultError;

/// Size of the AES-256-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// The secrets vault.
///
/// Cheap to clone; the key is copied, the cipher is rebuilt per operation.
#[derive(Clone)]
pub struct SecretsVault {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretsVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(f, "SecretsVault")
    }
}

impl SecretsVault {
    /// Builds a vault from a raw 32-byte key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Builds a vault from the configured base64 key.
    ///
    /// A missing key is an error in production; in development a vault with
    /// an ephemeral random key is returned so local work proceeds (stored
    /// ciphertexts will not survive a restart, which the warning says).
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, VaultError> {
        match &config.encryption_key {
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| VaultError::EncryptionFailed(format!("bad key encoding: {}", e)))?;
                let len = bytes.len();
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| VaultError::InvalidKeyLength(len))?;
                Ok(Self::new(key))
            }
            None if config.is_development() => {
                warn!(
                    "ENCRYPTION_KEY is not set; using an ephemeral development key. \
                     Stored secrets will not decrypt after a restart."
                );
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                Ok(Self::new(key))
            }
            None => Err(VaultError::MissingKey),
        }
    }

    /// Encrypts a plaintext value.
    ///
    /// Randomised: a fresh nonce is drawn per call.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypts a stored ciphertext.
    ///
    /// Fails with `DecryptionFailed` on tamper or wrong key.
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let combined = BASE64
            .decode(encoded.trim())
            .map_err(|_| VaultError::InvalidCiphertext)?;

        // Minimum: nonce + tag (an empty plaintext has an empty ciphertext)
        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::InvalidCiphertext);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;
        let nonce = Nonce::from_slice(&combined[..NONCE_SIZE]);
        let plaintext = cipher
            .decrypt(nonce, &combined[NONCE_SIZE..])
            .map_err(|_| {
                VaultError::DecryptionFailed(
                    "ciphertext is invalid or was encrypted with a different key".to_string(),
                )
            })?;

        String::from_utf8(plaintext).map_err(|e| VaultError::DecryptionFailed(e.to_string()))
    }

    /// Fetches every stored secret and parameter as a plaintext map.
    ///
    /// Non-parameter entries are decrypted; parameters pass through verbatim.
    /// Individual decryption failures are logged and skipped — one corrupt
    /// entry never hides the rest.
    pub async fn get_all(&self, dal: &DAL) -> Result<HashMap<String, String>, crate::error::ValidationError> {
        let secrets = dal.secret().list().await?;
        let mut result = HashMap::with_capacity(secrets.len());
        for secret in secrets {
            if secret.is_parameter {
                result.insert(secret.key, secret.value);
                continue;
            }
            match self.decrypt(&secret.value) {
                Ok(plaintext) => {
                    result.insert(secret.key, plaintext);
                }
                Err(e) => {
                    warn!(key = %secret.key, error = %e, "Skipping undecryptable secret");
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> SecretsVault {
        SecretsVault::new([0x42u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let vault = test_vault();
        let encrypted = vault.encrypt("s3cret-value").unwrap();
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "s3cret-value");
    }

    #[test]
    fn test_encrypt_is_randomised() {
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.decrypt(&a).unwrap(), vault.decrypt(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let vault = test_vault();
        let other = SecretsVault::new([0x43u8; 32]);
        let encrypted = vault.encrypt("value").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(VaultError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = test_vault();
        let encrypted = vault.encrypt("value").unwrap();
        let mut raw = BASE64.decode(&encrypted).unwrap();
        raw[NONCE_SIZE + 2] ^= 0xFF;
        let tampered = BASE64.encode(raw);
        assert!(vault.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_garbage_input_fails() {
        let vault = test_vault();
        assert!(matches!(
            vault.decrypt("not base64 at all!"),
            Err(VaultError::InvalidCiphertext)
        ));
        assert!(matches!(
            vault.decrypt(&BASE64.encode([0u8; 10])),
            Err(VaultError::InvalidCiphertext)
        ));
    }

    #[test]
    fn test_empty_plaintext_round_trips() {
        let vault = test_vault();
        let encrypted = vault.encrypt("").unwrap();
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "");
    }
}
