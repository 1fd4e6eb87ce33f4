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

pub mod api;
pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod keys;
pub mod logging;
pub mod model;
pub mod registry;
pub mod script;
pub mod settings;
mod storage;
pub mod validation;

pub use audit::{AuditJournal, AuditLog, LogPage, TaskSummary};
pub use config::QuireConfig;
pub use dispatcher::Dispatcher;
pub use error::{AuditError, ConfigError, EngineError, ExecutionFailure, RegistryError, StoreError};
pub use executor::Executor;
pub use hooks::{CustomKindHandler, DispatchHooks, ExecutionHooks, ExecutionObserver};
pub use keys::{ApiKeyRing, ApiKeySummary, IssuedKey, JsonFileKeyStore, KeyStore, MemoryKeyStore};
pub use model::{
    DispatchResponse, ExecutionRequest, FunctionDefinition, FunctionKind, LogEntry, LogStatus, NewLogEntry,
    PublicFunction, SaveFunction, SyntaxLayer, ValidationResult,
};
pub use registry::{FunctionRegistry, FunctionStore, JsonFileFunctionStore, MemoryFunctionStore};
pub use settings::{Settings, SettingsStore};
pub use validation::{FunctionValidator, SyntaxCapabilities, SyntaxChecker};

use std::sync::Arc;
use tracing::info;

/// Caller-supplied extension points, wired in when the engine is built.
#[derive(Default)]
pub struct Extensions {
    pub execution: ExecutionHooks,
    pub dispatch: DispatchHooks,
    pub custom_kinds: Vec<Arc<dyn CustomKindHandler>>,
}

/// Owns every component and hands out shared handles to them.
pub struct Engine {
    config: QuireConfig,
    settings: SettingsStore,
    keys: Arc<ApiKeyRing>,
    validator: Arc<FunctionValidator>,
    registry: Arc<FunctionRegistry>,
    executor: Arc<Executor>,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditJournal>,
}

impl Engine {
    pub async fn new(
        config: QuireConfig,
        store: Arc<dyn FunctionStore>,
        audit: Arc<AuditJournal>,
    ) -> Result<Self, EngineError> {
        Self::with_extensions(config, store, audit, Extensions::default()).await
    }

    /// Keys and settings come from `config.storage`, in memory where unset.
    pub async fn with_extensions(
        config: QuireConfig,
        store: Arc<dyn FunctionStore>,
        audit: Arc<AuditJournal>,
        extensions: Extensions,
    ) -> Result<Self, EngineError> {
        let capabilities = SyntaxCapabilities::resolve(&config.validation);
        let validator = Arc::new(FunctionValidator::new(SyntaxChecker::new(capabilities)));
        let registry = Arc::new(FunctionRegistry::open(store, Arc::clone(&validator)).await?);
        let executor = Arc::new(Executor::new(&config.execution, extensions.execution));

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&audit) as Arc<dyn AuditLog>,
        )
        .with_hooks(extensions.dispatch)
        .with_batch_concurrency(config.execution.batch_concurrency);
        for handler in extensions.custom_kinds {
            dispatcher = dispatcher.with_custom_handler(handler);
        }

        let key_store: Arc<dyn KeyStore> = match &config.storage.keys_path {
            Some(path) => Arc::new(JsonFileKeyStore::new(path)),
            None => Arc::new(MemoryKeyStore::new()),
        };
        let keys = Arc::new(ApiKeyRing::open(key_store, config.auth.api_keys.clone()).await?);
        let defaults = Settings {
            enabled: config.server.enabled,
        };
        let settings = match &config.storage.settings_path {
            Some(path) => SettingsStore::open(path, defaults).await?,
            None => SettingsStore::in_memory(defaults),
        };

        info!(
            functions = registry.len(),
            enabled = settings.current().enabled,
            "Engine ready"
        );
        Ok(Self {
            config,
            settings,
            keys,
            validator,
            registry,
            executor,
            dispatcher: Arc::new(dispatcher),
            audit,
        })
    }

    /// Builds the stores named in `config.storage`, in memory where unset.
    pub async fn from_config(config: QuireConfig) -> Result<Self, EngineError> {
        Self::from_config_with_extensions(config, Extensions::default()).await
    }

    pub async fn from_config_with_extensions(config: QuireConfig, extensions: Extensions) -> Result<Self, EngineError> {
        let store: Arc<dyn FunctionStore> = match &config.storage.functions_path {
            Some(path) => Arc::new(JsonFileFunctionStore::new(path)),
            None => Arc::new(MemoryFunctionStore::new()),
        };
        let audit = match &config.storage.audit_path {
            Some(path) => AuditJournal::open(path, config.storage.audit_retention).await?,
            None => AuditJournal::in_memory(config.storage.audit_retention),
        };
        Self::with_extensions(config, store, Arc::new(audit), extensions).await
    }

    pub fn config(&self) -> &QuireConfig {
        &self.config
    }

    pub fn validator(&self) -> &Arc<FunctionValidator> {
        &self.validator
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn audit(&self) -> &Arc<AuditJournal> {
        &self.audit
    }

    pub fn keys(&self) -> &Arc<ApiKeyRing> {
        &self.keys
    }

    pub fn enabled(&self) -> bool {
        self.settings.current().enabled
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<Settings, StoreError> {
        let settings = self.settings.set_enabled(enabled).await?;
        info!(enabled, "Execution routes toggled");
        Ok(settings)
    }

    pub async fn validate_function(&self, request: &SaveFunction) -> ValidationResult {
        self.registry.validate(request).await
    }

    /// Saves through admission and drops compiled forms that no longer
    /// match what is stored.
    pub async fn save_function(&self, request: SaveFunction) -> Result<FunctionDefinition, RegistryError> {
        let (saved, previous) = self.registry.save(request).await?;
        if let Some(previous) = previous {
            self.executor.forget(&previous.name);
        }
        Ok(saved)
    }

    pub async fn delete_function(&self, name: &str) -> Result<FunctionDefinition, RegistryError> {
        let removed = self.registry.delete(name).await?;
        self.executor.forget(&removed.name);
        Ok(removed)
    }

    pub async fn process(&self, request: ExecutionRequest) -> DispatchResponse {
        self.dispatcher.dispatch(request).await
    }
}
