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

//! The saved-function catalogue. All writes go through admission and are
//! serialised; readers always see either the old list or the new one.

pub mod store;

pub use store::{FunctionStore, JsonFileFunctionStore, MemoryFunctionStore};

use crate::error::{RegistryError, StoreError};
use crate::logging;
use crate::model::{FunctionDefinition, FunctionKind, PublicFunction, SaveFunction, ValidationResult};
use crate::script::builtins::sanitize_text;
use crate::validation::FunctionValidator;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

const REQUIRED: &str = "Function name and code are required";

pub struct FunctionRegistry {
    functions: RwLock<Arc<Vec<FunctionDefinition>>>,
    admission: Mutex<()>,
    store: Arc<dyn FunctionStore>,
    validator: Arc<FunctionValidator>,
}

impl FunctionRegistry {
    pub async fn open(store: Arc<dyn FunctionStore>, validator: Arc<FunctionValidator>) -> Result<Self, StoreError> {
        let functions = store.load().await?;
        info!(count = functions.len(), "Function registry loaded");
        Ok(Self {
            functions: RwLock::new(Arc::new(functions)),
            admission: Mutex::new(()),
            store,
            validator,
        })
    }

    fn snapshot(&self) -> Arc<Vec<FunctionDefinition>> {
        Arc::clone(&*self.functions.read())
    }

    pub fn get(&self, name: &str) -> Option<FunctionDefinition> {
        self.snapshot().iter().find(|f| f.name == name).cloned()
    }

    pub fn list(&self) -> Vec<FunctionDefinition> {
        self.snapshot().as_ref().clone()
    }

    pub fn public_functions(&self) -> Vec<PublicFunction> {
        self.snapshot().iter().map(FunctionDefinition::public).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn validate(&self, request: &SaveFunction) -> ValidationResult {
        if request.name.trim().is_empty() || request.code.trim().is_empty() {
            return ValidationResult::invalid(REQUIRED);
        }
        if let Some(message) = self.name_conflict(&self.snapshot(), request) {
            return ValidationResult::invalid(message);
        }
        self.validator.validate_function_code(&request.name, &request.code).await
    }

    /// Admits and stores a definition, returning what was stored. The
    /// previous definition (if this was an update) is returned alongside.
    pub async fn save(
        &self,
        request: SaveFunction,
    ) -> Result<(FunctionDefinition, Option<FunctionDefinition>), RegistryError> {
        if request.name.trim().is_empty() || request.code.trim().is_empty() {
            return Err(RegistryError::BadRequest(REQUIRED.to_string()));
        }
        let requested_id = match request.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(raw) => Some(
                Uuid::parse_str(raw).map_err(|_| RegistryError::BadRequest(format!("Invalid function id '{raw}'")))?,
            ),
            None => None,
        };

        let _admission = self.admission.lock().await;
        let current = self.snapshot();

        if let Some(message) = self.name_conflict(&current, &request) {
            return Err(RegistryError::NameConflict(message));
        }
        let verdict = self.validator.validate_function_code(&request.name, &request.code).await;
        if !verdict.valid {
            return Err(RegistryError::AdmissionRejected(verdict.message));
        }

        let name = sanitize_text(request.name.trim());
        let label = request
            .label
            .as_deref()
            .map(sanitize_text)
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| name.clone());
        let kind = match request.kind {
            Some(FunctionKind::Custom(custom)) => FunctionKind::from(sanitize_text(&custom)),
            Some(kind) => kind,
            None => FunctionKind::default(),
        };
        let definition = FunctionDefinition {
            id: requested_id.unwrap_or_else(Uuid::new_v4),
            name,
            label,
            source: request.code,
            kind,
        };

        let mut next = current.as_ref().clone();
        let previous = match next.iter().position(|f| Some(f.id) == requested_id) {
            Some(index) => Some(std::mem::replace(&mut next[index], definition.clone())),
            None => {
                next.push(definition.clone());
                None
            }
        };
        self.store.save_all(&next).await?;
        *self.functions.write() = Arc::new(next);

        logging::log_registry_event(if previous.is_some() { "updated" } else { "created" }, &definition.name);
        Ok((definition, previous))
    }

    pub async fn delete(&self, name: &str) -> Result<FunctionDefinition, RegistryError> {
        let name = sanitize_text(name);
        let _admission = self.admission.lock().await;
        let current = self.snapshot();
        let index = current
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| RegistryError::NotFound("Function not found".to_string()))?;

        let mut next = current.as_ref().clone();
        let removed = next.remove(index);
        self.store.save_all(&next).await?;
        *self.functions.write() = Arc::new(next);

        logging::log_registry_event("deleted", &removed.name);
        Ok(removed)
    }

    /// A name is free unless another definition holds it. Requests carrying
    /// the holder's own id are updates.
    fn name_conflict(&self, current: &[FunctionDefinition], request: &SaveFunction) -> Option<String> {
        let name = request.name.trim();
        let existing = current.iter().find(|f| f.name == name)?;
        let same_id = request
            .id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id.trim()).ok())
            .is_some_and(|id| id == existing.id);
        (!same_id).then(|| format!("Function name '{name}' is already in use by another saved function."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> FunctionRegistry {
        FunctionRegistry::open(
            Arc::new(MemoryFunctionStore::new()),
            Arc::new(FunctionValidator::default()),
        )
        .await
        .unwrap()
    }

    fn request(name: &str) -> SaveFunction {
        SaveFunction {
            name: name.to_string(),
            code: format!("function {name}($record) {{ return $record; }}"),
            ..SaveFunction::default()
        }
    }

    #[tokio::test]
    async fn test_save_applies_defaults() {
        let registry = registry().await;
        let (saved, previous) = registry.save(request("enrich")).await.unwrap();
        assert!(previous.is_none());
        assert_eq!(saved.label, "enrich");
        assert_eq!(saved.kind, FunctionKind::BatchRecord);
        assert_eq!(registry.get("enrich"), Some(saved));
        assert_eq!(registry.public_functions()[0].label, "enrich");
    }

    #[tokio::test]
    async fn test_label_is_sanitised() {
        let registry = registry().await;
        let mut req = request("enrich");
        req.label = Some("  <b>Enrich</b>\n rows ".into());
        let (saved, _) = registry.save(req).await.unwrap();
        assert_eq!(saved.label, "Enrich rows");
    }

    #[tokio::test]
    async fn test_required_fields() {
        let registry = registry().await;
        let err = registry.save(SaveFunction::default()).await.unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(ref m) if m == REQUIRED));
        assert_eq!(registry.validate(&SaveFunction::default()).await.message, REQUIRED);
    }

    #[tokio::test]
    async fn test_name_conflict_without_matching_id() {
        let registry = registry().await;
        let (saved, _) = registry.save(request("enrich")).await.unwrap();

        let err = registry.save(request("enrich")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function name 'enrich' is already in use by another saved function."
        );
        assert!(matches!(err, RegistryError::NameConflict(_)));

        let mut other = request("enrich");
        other.id = Some(Uuid::new_v4().to_string());
        assert!(matches!(registry.save(other).await, Err(RegistryError::NameConflict(_))));

        let mut update = request("enrich");
        update.id = Some(saved.id.to_string());
        update.label = Some("Enrich v2".into());
        let (updated, previous) = registry.save(update).await.unwrap();
        assert_eq!(updated.id, saved.id);
        assert_eq!(previous, Some(saved));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_update_by_id_can_rename() {
        let registry = registry().await;
        let (saved, _) = registry.save(request("enrich")).await.unwrap();
        let mut rename = request("enrich_rows");
        rename.id = Some(saved.id.to_string());
        registry.save(rename).await.unwrap();
        assert!(registry.get("enrich").is_none());
        assert_eq!(registry.get("enrich_rows").map(|f| f.id), Some(saved.id));
    }

    #[tokio::test]
    async fn test_unknown_id_creates() {
        let registry = registry().await;
        let id = Uuid::new_v4();
        let mut req = request("enrich");
        req.id = Some(id.to_string());
        let (saved, previous) = registry.save(req).await.unwrap();
        assert_eq!(saved.id, id);
        assert!(previous.is_none());

        let mut bad = request("other");
        bad.id = Some("not-a-uuid".into());
        assert!(matches!(registry.save(bad).await, Err(RegistryError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_rejected_code_is_not_stored() {
        let registry = registry().await;
        let mut req = request("enrich");
        req.code = "function enrich($record) { exec('rm -rf /'); return $record; }".into();
        let err = registry.save(req).await.unwrap_err();
        assert_eq!(err.to_string(), "Dangerous function 'exec' detected in code.");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let registry = registry().await;
        registry.save(request("enrich")).await.unwrap();
        assert!(matches!(registry.delete("missing").await, Err(RegistryError::NotFound(_))));
        assert_eq!(registry.delete("enrich").await.unwrap().name, "enrich");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_validate_does_not_persist() {
        let registry = registry().await;
        let result = registry.validate(&request("enrich")).await;
        assert!(result.valid, "{}", result.message);
        assert!(registry.is_empty());
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl FunctionStore for FailingStore {
        async fn load(&self) -> Result<Vec<FunctionDefinition>, StoreError> {
            Ok(Vec::new())
        }

        async fn save_all(&self, _: &[FunctionDefinition]) -> Result<(), StoreError> {
            Err(StoreError::Persist {
                path: "memory".into(),
                reason: "disk full".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_list_untouched() {
        let registry = FunctionRegistry::open(Arc::new(FailingStore), Arc::new(FunctionValidator::default()))
            .await
            .unwrap();
        let err = registry.save(request("enrich")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(registry.is_empty());
    }
}
