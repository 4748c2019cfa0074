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

use fastflow::models::NewSecret;
use fastflow::SecretsVault;

use crate::test_dal;

#[tokio::test]
async fn test_get_all_decrypts_secrets_and_passes_parameters() {
    let dal = test_dal().await;
    let vault = SecretsVault::new([7u8; 32]);

    dal.secret()
        .upsert(NewSecret {
            key: "env/DATABASE_URL".to_string(),
            value: vault.encrypt("postgres://prod").unwrap(),
            is_parameter: false,
        })
        .await
        .unwrap();
    dal.secret()
        .upsert(NewSecret {
            key: "REGION".to_string(),
            value: "eu-central-1".to_string(),
            is_parameter: true,
        })
        .await
        .unwrap();

    let all = vault.get_all(&dal).await.unwrap();
    assert_eq!(
        all.get("env/DATABASE_URL").map(String::as_str),
        Some("postgres://prod")
    );
    assert_eq!(all.get("REGION").map(String::as_str), Some("eu-central-1"));
}

#[tokio::test]
async fn test_get_all_skips_undecryptable_entries() {
    let dal = test_dal().await;
    let vault = SecretsVault::new([7u8; 32]);
    let other_vault = SecretsVault::new([8u8; 32]);

    dal.secret()
        .upsert(NewSecret {
            key: "GOOD".to_string(),
            value: vault.encrypt("usable").unwrap(),
            is_parameter: false,
        })
        .await
        .unwrap();
    // Encrypted under a different key; decryption fails but never aborts the
    // batch
    dal.secret()
        .upsert(NewSecret {
            key: "BAD".to_string(),
            value: other_vault.encrypt("lost").unwrap(),
            is_parameter: false,
        })
        .await
        .unwrap();

    let all = vault.get_all(&dal).await.unwrap();
    assert_eq!(all.get("GOOD").map(String::as_str), Some("usable"));
    assert!(!all.contains_key("BAD"));
}

#[tokio::test]
async fn test_secret_upsert_replaces_value() {
    let dal = test_dal().await;
    let vault = SecretsVault::new([7u8; 32]);

    dal.secret()
        .upsert(NewSecret {
            key: "TOKEN".to_string(),
            value: vault.encrypt("v1").unwrap(),
            is_parameter: false,
        })
        .await
        .unwrap();
    dal.secret()
        .upsert(NewSecret {
            key: "TOKEN".to_string(),
            value: vault.encrypt("v2").unwrap(),
            is_parameter: false,
        })
        .await
        .unwrap();

    let all = vault.get_all(&dal).await.unwrap();
    assert_eq!(all.get("TOKEN").map(String::as_str), Some("v2"));
    assert_eq!(dal.secret().list().await.unwrap().len(), 1);

    assert!(dal.secret().delete("TOKEN").await.unwrap());
    assert!(!dal.secret().delete("TOKEN").await.unwrap());
}

#[tokio::test]
async fn test_invalid_secret_key_rejected_at_boundary() {
    let dal = test_dal().await;
    let result = dal
        .secret()
        .upsert(NewSecret {
            key: "../escape".to_string(),
            value: "x".to_string(),
            is_parameter: true,
        })
        .await;
    assert!(result.is_err());
}
