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

use crate::error::StoreError;
use crate::model::FunctionDefinition;
use crate::storage;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the registry keeps its definitions between restarts.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn load(&self) -> Result<Vec<FunctionDefinition>, StoreError>;

    /// Replaces the whole stored list.
    async fn save_all(&self, functions: &[FunctionDefinition]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryFunctionStore {
    functions: RwLock<Vec<FunctionDefinition>>,
}

impl MemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_functions(functions: Vec<FunctionDefinition>) -> Self {
        Self {
            functions: RwLock::new(functions),
        }
    }
}

#[async_trait]
impl FunctionStore for MemoryFunctionStore {
    async fn load(&self) -> Result<Vec<FunctionDefinition>, StoreError> {
        Ok(self.functions.read().clone())
    }

    async fn save_all(&self, functions: &[FunctionDefinition]) -> Result<(), StoreError> {
        *self.functions.write() = functions.to_vec();
        Ok(())
    }
}

/// One pretty-printed JSON array, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileFunctionStore {
    path: PathBuf,
}

impl JsonFileFunctionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FunctionStore for JsonFileFunctionStore {
    async fn load(&self) -> Result<Vec<FunctionDefinition>, StoreError> {
        let Some(content) = storage::read_optional(&self.path).await? else {
            debug!(path = %self.path.display(), "No function store yet, starting empty");
            return Ok(Vec::new());
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save_all(&self, functions: &[FunctionDefinition]) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(functions)?;
        storage::replace_file_async(self.path.clone(), body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionKind;
    use uuid::Uuid;

    fn definition(name: &str) -> FunctionDefinition {
        FunctionDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            label: name.to_uppercase(),
            source: format!("function {name}($record) {{ return $record; }}"),
            kind: FunctionKind::PagedImport,
        }
    }

    #[tokio::test]
    async fn test_json_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileFunctionStore::new(dir.path().join("nested").join("functions.json"));
        assert!(store.load().await.unwrap().is_empty());

        let functions = vec![definition("alpha"), definition("beta")];
        store.save_all(&functions).await.unwrap();
        assert_eq!(store.load().await.unwrap(), functions);

        store.save_all(&functions[1..]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), functions[1..].to_vec());
        let leftovers = std::fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("functions.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileFunctionStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Serialisation(_)));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryFunctionStore::with_functions(vec![definition("alpha")]);
        assert_eq!(store.load().await.unwrap().len(), 1);
        store.save_all(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
