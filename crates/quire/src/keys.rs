// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! API keys issued from the admin surface. The secret is shown once, when
//! the key is created; listings carry only its id, name and creation time.

use crate::error::StoreError;
use crate::script::builtins::sanitize_text;
use crate::storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A key as persisted, secret included.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub id: Uuid,
    pub name: String,
    pub secret: String,
    pub created: DateTime<Utc>,
}

/// What listings show.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub name: String,
    pub created: String,
}

/// The response to a create: the summary plus the secret.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IssuedKey {
    pub id: Uuid,
    pub name: String,
    pub key: String,
    pub created: String,
}

impl StoredKey {
    fn summary(&self) -> ApiKeySummary {
        ApiKeySummary {
            id: self.id,
            name: self.name.clone(),
            created: self.created.format(CREATED_FORMAT).to_string(),
        }
    }
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load(&self) -> Result<Vec<StoredKey>, StoreError>;

    async fn save_all(&self, keys: &[StoredKey]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<Vec<StoredKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Vec<StoredKey>, StoreError> {
        Ok(self.keys.read().clone())
    }

    async fn save_all(&self, keys: &[StoredKey]) -> Result<(), StoreError> {
        *self.keys.write() = keys.to_vec();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JsonFileKeyStore {
    path: PathBuf,
}

impl JsonFileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyStore for JsonFileKeyStore {
    async fn load(&self) -> Result<Vec<StoredKey>, StoreError> {
        match storage::read_optional(&self.path).await? {
            Some(content) if !content.trim().is_empty() => Ok(serde_json::from_str(&content)?),
            _ => {
                debug!(path = %self.path.display(), "No key store yet, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn save_all(&self, keys: &[StoredKey]) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(keys)?;
        storage::replace_file_async(self.path.clone(), body).await
    }
}

/// Issued keys plus the fixed ones from configuration. Writes are
/// serialised and only published once the store has accepted them.
pub struct ApiKeyRing {
    fixed: Vec<String>,
    issued: RwLock<Arc<Vec<StoredKey>>>,
    writer: Mutex<()>,
    store: Arc<dyn KeyStore>,
}

impl ApiKeyRing {
    pub async fn open(store: Arc<dyn KeyStore>, fixed: Vec<String>) -> Result<Self, StoreError> {
        let issued = store.load().await?;
        info!(issued = issued.len(), fixed = fixed.len(), "API keys loaded");
        Ok(Self {
            fixed,
            issued: RwLock::new(Arc::new(issued)),
            writer: Mutex::new(()),
            store,
        })
    }

    fn snapshot(&self) -> Arc<Vec<StoredKey>> {
        Arc::clone(&*self.issued.read())
    }

    pub fn accepts(&self, key: &str) -> bool {
        !key.is_empty() && (self.fixed.iter().any(|k| k == key) || self.snapshot().iter().any(|k| k.secret == key))
    }

    pub fn list(&self) -> Vec<ApiKeySummary> {
        self.snapshot().iter().map(StoredKey::summary).collect()
    }

    /// Issues a new key. A blank name becomes `API Key <timestamp>`.
    pub async fn create(&self, name: &str) -> Result<IssuedKey, StoreError> {
        let created = Utc::now();
        let name = match sanitize_text(name.trim()) {
            n if n.is_empty() => format!("API Key {}", created.format(CREATED_FORMAT)),
            n => n,
        };
        let key = StoredKey {
            id: Uuid::new_v4(),
            name,
            secret: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
            created,
        };

        let _writer = self.writer.lock().await;
        let mut next = self.snapshot().as_ref().clone();
        next.push(key.clone());
        self.store.save_all(&next).await?;
        *self.issued.write() = Arc::new(next);
        info!(id = %key.id, name = %key.name, "API key issued");

        let summary = key.summary();
        Ok(IssuedKey {
            id: summary.id,
            name: summary.name,
            key: key.secret,
            created: summary.created,
        })
    }

    /// `Ok(false)` when no issued key has this id.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Ok(id) = Uuid::parse_str(id.trim()) else {
            return Ok(false);
        };
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        if !current.iter().any(|k| k.id == id) {
            return Ok(false);
        }
        let next: Vec<StoredKey> = current.iter().filter(|k| k.id != id).cloned().collect();
        self.store.save_all(&next).await?;
        *self.issued.write() = Arc::new(next);
        info!(%id, "API key revoked");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ring(store: Arc<dyn KeyStore>) -> ApiKeyRing {
        ApiKeyRing::open(store, vec!["fixed".into()]).await.unwrap()
    }

    #[tokio::test]
    async fn test_issue_list_and_revoke() {
        let keys = ring(Arc::new(MemoryKeyStore::new())).await;
        assert!(keys.accepts("fixed"));
        assert!(!keys.accepts(""));

        let issued = keys.create("  Sheets <b>prod</b> ").await.unwrap();
        assert_eq!(issued.name, "Sheets prod");
        assert_eq!(issued.key.len(), 64);
        assert!(keys.accepts(&issued.key));

        let listed = keys.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, issued.id);
        assert_eq!(listed[0].created.len(), "2024-01-01 00:00:00".len());

        assert!(!keys.delete("not-a-uuid").await.unwrap());
        assert!(!keys.delete(&Uuid::new_v4().to_string()).await.unwrap());
        assert!(keys.delete(&issued.id.to_string()).await.unwrap());
        assert!(!keys.accepts(&issued.key));
        assert!(keys.accepts("fixed"));
    }

    #[tokio::test]
    async fn test_blank_name_gets_timestamp() {
        let keys = ring(Arc::new(MemoryKeyStore::new())).await;
        let issued = keys.create("   ").await.unwrap();
        assert!(issued.name.starts_with("API Key 20"), "{}", issued.name);
    }

    #[tokio::test]
    async fn test_issued_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let issued = ring(Arc::new(JsonFileKeyStore::new(&path)))
            .await
            .create("sheets")
            .await
            .unwrap();

        let reopened = ring(Arc::new(JsonFileKeyStore::new(&path))).await;
        assert!(reopened.accepts(&issued.key));
        assert_eq!(reopened.list()[0].name, "sheets");
    }
}
