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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NameConflict(String),
    #[error("{0}")]
    AdmissionRejected(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
    #[error("Failed to persist '{path}': {reason}")]
    Persist { path: String, reason: String },
}

/// A failed invocation. The message is safe to show to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to write audit journal '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
    #[error("Failed to rewrite audit journal: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigFileError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {source}")]
    TomlParseError {
        #[from]
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Persistent store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("Audit journal unavailable: {0}")]
    Audit(#[from] AuditError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
