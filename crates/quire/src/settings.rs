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

//! Runtime settings that outlive a restart. Only the execution switch
//! exists today; it is read on every execution request.

use crate::error::StoreError;
use crate::storage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    #[serde(alias = "plugin_enabled")]
    pub enabled: bool,
}

/// The current settings, mirrored to a JSON file when a path is given.
pub struct SettingsStore {
    enabled: AtomicBool,
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl SettingsStore {
    pub fn in_memory(defaults: Settings) -> Self {
        Self {
            enabled: AtomicBool::new(defaults.enabled),
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// A saved file wins over `defaults`.
    pub async fn open(path: impl Into<PathBuf>, defaults: Settings) -> Result<Self, StoreError> {
        let path = path.into();
        let settings = match storage::read_optional(&path).await? {
            Some(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            _ => defaults,
        };
        info!(path = %path.display(), enabled = settings.enabled, "Settings loaded");
        Ok(Self {
            enabled: AtomicBool::new(settings.enabled),
            path: Some(path),
            writer: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Settings {
        Settings {
            enabled: self.enabled.load(Ordering::Relaxed),
        }
    }

    /// Persists first; the flag only flips once the file is written.
    pub async fn set_enabled(&self, enabled: bool) -> Result<Settings, StoreError> {
        let _writer = self.writer.lock().await;
        let next = Settings { enabled };
        if let Some(path) = &self.path {
            storage::replace_file_async(path.clone(), serde_json::to_vec_pretty(&next)?).await?;
        }
        self.enabled.store(enabled, Ordering::Relaxed);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_saved_flag_beats_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = SettingsStore::open(&path, Settings { enabled: true }).await.unwrap();
        assert!(settings.current().enabled);
        settings.set_enabled(false).await.unwrap();

        let reopened = SettingsStore::open(&path, Settings { enabled: true }).await.unwrap();
        assert_eq!(reopened.current(), Settings { enabled: false });
    }

    #[tokio::test]
    async fn test_accepts_plugin_enabled_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"plugin_enabled": false}"#).unwrap();
        let settings = SettingsStore::open(&path, Settings { enabled: true }).await.unwrap();
        assert!(!settings.current().enabled);
    }

    #[tokio::test]
    async fn test_in_memory_toggle() {
        let settings = SettingsStore::in_memory(Settings { enabled: false });
        assert_eq!(settings.set_enabled(true).await.unwrap(), Settings { enabled: true });
        assert!(settings.current().enabled);
    }
}
