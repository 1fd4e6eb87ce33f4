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

use crate::error::ConfigError;
use crate::script::Limits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct QuireConfig {
    pub server: ServerConfig,
    pub validation: ValidationConfig,
    pub execution: ExecutionConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Execution routes answer 403 while this is off.
    pub enabled: bool,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            enabled: true,
            log_json: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub parser: bool,
    pub lint: bool,
    pub lint_binaries: Vec<String>,
    pub lint_timeout_ms: u64,
    pub tokens: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            parser: true,
            lint: true,
            lint_binaries: ["php", "/usr/bin/php", "/usr/local/bin/php", "/opt/php/bin/php"]
                .into_iter()
                .map(String::from)
                .collect(),
            lint_timeout_ms: 5_000,
            tokens: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub gas: u64,
    pub max_call_depth: usize,
    pub max_string_bytes: usize,
    pub max_array_len: usize,
    pub batch_concurrency: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            timeout_ms: 30_000,
            gas: limits.gas,
            max_call_depth: limits.max_call_depth,
            max_string_bytes: limits.max_string_bytes,
            max_array_len: limits.max_array_len,
            batch_concurrency: 1,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interpreter limits without a deadline; the executor adds one per call.
    pub fn limits(&self) -> Limits {
        Limits {
            gas: self.gas,
            max_call_depth: self.max_call_depth,
            max_string_bytes: self.max_string_bytes,
            max_array_len: self.max_array_len,
            ..Limits::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON document holding every saved function. In memory when unset.
    pub functions_path: Option<PathBuf>,
    /// JSON-lines mirror of the audit journal.
    pub audit_path: Option<PathBuf>,
    pub audit_retention: Option<usize>,
    /// Issued API keys.
    pub keys_path: Option<PathBuf>,
    /// Saved runtime settings; overrides `server.enabled` once written.
    pub settings_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Admin routes reject every request while unset.
    pub admin_token: Option<String>,
    /// Always accepted, alongside any keys issued at runtime.
    pub api_keys: Vec<String>,
}

impl QuireConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ConfigFileError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// File (or defaults), then `.env`, then `QUIRE_*` variables, then checks.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Self::load_from_file(path)?
            }
            None => Self::default(),
        };
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env");
        }
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(bind) = lookup("QUIRE_BIND") {
            self.server.bind = bind;
        }
        if let Some(enabled) = lookup("QUIRE_ENABLED") {
            self.server.enabled = parse_var("QUIRE_ENABLED", &enabled)?;
        }
        if let Some(json) = lookup("QUIRE_LOG_JSON") {
            self.server.log_json = parse_var("QUIRE_LOG_JSON", &json)?;
        }
        if let Some(binaries) = lookup("QUIRE_LINT_BINARIES") {
            self.validation.lint_binaries = split_list(&binaries);
        }
        if let Some(timeout) = lookup("QUIRE_EXECUTION_TIMEOUT_MS") {
            self.execution.timeout_ms = parse_var("QUIRE_EXECUTION_TIMEOUT_MS", &timeout)?;
        }
        if let Some(gas) = lookup("QUIRE_GAS") {
            self.execution.gas = parse_var("QUIRE_GAS", &gas)?;
        }
        if let Some(concurrency) = lookup("QUIRE_BATCH_CONCURRENCY") {
            self.execution.batch_concurrency = parse_var("QUIRE_BATCH_CONCURRENCY", &concurrency)?;
        }
        if let Some(path) = lookup("QUIRE_FUNCTIONS_PATH") {
            self.storage.functions_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("QUIRE_AUDIT_PATH") {
            self.storage.audit_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("QUIRE_KEYS_PATH") {
            self.storage.keys_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("QUIRE_SETTINGS_PATH") {
            self.storage.settings_path = Some(PathBuf::from(path));
        }
        if let Some(token) = lookup("QUIRE_ADMIN_TOKEN") {
            self.auth.admin_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(keys) = lookup("QUIRE_API_KEYS") {
            self.auth.api_keys = split_list(&keys);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        let positive = [
            ("validation.lint_timeout_ms", self.validation.lint_timeout_ms),
            ("execution.timeout_ms", self.execution.timeout_ms),
            ("execution.gas", self.execution.gas),
            ("execution.max_call_depth", self.execution.max_call_depth as u64),
            ("execution.batch_concurrency", self.execution.batch_concurrency as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        if self.storage.audit_retention == Some(0) {
            return Err(invalid("storage.audit_retention", "must be greater than zero when set"));
        }
        if self.auth.api_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid("auth.api_keys", "keys cannot be blank"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid("server.bind", &e.to_string()))
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = QuireConfig::from_toml_str(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [execution]
            batch_concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(config.server.enabled);
        assert_eq!(config.execution.batch_concurrency, 4);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert!(config.validation.parser);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QUIRE_ENABLED", "false"),
            ("QUIRE_API_KEYS", "alpha, beta,,"),
            ("QUIRE_ADMIN_TOKEN", "root"),
            ("QUIRE_FUNCTIONS_PATH", "/var/lib/quire/functions.json"),
            ("QUIRE_SETTINGS_PATH", "/var/lib/quire/settings.json"),
        ]
        .into_iter()
        .collect();
        let mut config = QuireConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.server.enabled);
        assert_eq!(config.auth.api_keys, vec!["alpha", "beta"]);
        assert_eq!(config.auth.admin_token.as_deref(), Some("root"));
        assert_eq!(
            config.storage.functions_path,
            Some(PathBuf::from("/var/lib/quire/functions.json"))
        );
        assert_eq!(
            config.storage.settings_path,
            Some(PathBuf::from("/var/lib/quire/settings.json"))
        );
        assert_eq!(config.storage.keys_path, None);
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut config = QuireConfig::default();
        let err = config
            .apply_overrides(|key| (key == "QUIRE_GAS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for QUIRE_GAS"));
    }

    #[test]
    fn test_validation_rejects_zero_and_bad_bind() {
        let mut config = QuireConfig::default();
        config.execution.batch_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = QuireConfig::default();
        config.server.bind = "not an address".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { key, .. }) if key == "server.bind"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = QuireConfig::load_from_file(Path::new("/nonexistent/quire.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileError { .. }));
    }

    #[test]
    fn test_limits_follow_execution_section() {
        let mut config = ExecutionConfig::default();
        config.gas = 42;
        let limits = config.limits();
        assert_eq!(limits.gas, 42);
        assert!(limits.deadline.is_none());
    }
}
