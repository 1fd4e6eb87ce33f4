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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use std::fmt;
use uuid::Uuid;

/// How a function is invoked by the dispatcher. Unknown wire names become
/// `Custom` so plugins can claim them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FunctionKind {
    #[default]
    BatchRecord,
    PagedImport,
    OneShotTrigger,
    Custom(String),
}

impl FunctionKind {
    pub const BUILT_IN: [Self; 3] = [Self::BatchRecord, Self::PagedImport, Self::OneShotTrigger];

    pub fn as_str(&self) -> &str {
        match self {
            Self::BatchRecord => "upload_to_website",
            Self::PagedImport => "import_to_sheet",
            Self::OneShotTrigger => "one_time_trigger",
            Self::Custom(name) => name,
        }
    }

    pub fn is_built_in(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<String> for FunctionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "upload_to_website" => Self::BatchRecord,
            "import_to_sheet" => Self::PagedImport,
            "one_time_trigger" => Self::OneShotTrigger,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for FunctionKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<FunctionKind> for String {
    fn from(kind: FunctionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    #[serde(rename = "code")]
    pub source: String,
    #[serde(rename = "type", default)]
    pub kind: FunctionKind,
}

impl FunctionDefinition {
    pub fn public(&self) -> PublicFunction {
        PublicFunction {
            name: self.name.clone(),
            label: self.label.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// What execution clients may see of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicFunction {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: FunctionKind,
}

/// Admission request. `id` is kept as text so malformed ids can be
/// reported rather than rejected by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFunction {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(rename = "type", default)]
    pub kind: Option<FunctionKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxLayer {
    Parser,
    Lint,
    Tokens,
    #[serde(rename = "none")]
    Unavailable,
}

impl fmt::Display for SyntaxLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parser => "parser",
            Self::Lint => "lint",
            Self::Tokens => "tokens",
            Self::Unavailable => "none",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_by: Option<SyntaxLayer>,
}

impl ValidationResult {
    pub fn valid(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
            checked_by: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            checked_by: None,
        }
    }

    pub fn checked_by(mut self, layer: SyntaxLayer) -> Self {
        self.checked_by = Some(layer);
        self
    }
}

/// Accepts strings and numbers; anything else reads as absent.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Json>::deserialize(deserializer)? {
        Some(Json::String(s)) => Some(s),
        Some(Json::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// One `/process` call as it arrives on the wire. Every field is optional
/// here so the dispatcher can report what is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub task_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub method: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    #[serde(default)]
    pub params: Option<Json>,
    #[serde(default)]
    pub meta: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DispatchResponse {
    pub fn success(data: Json) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    /// What the audit log records as the response.
    pub fn snapshot(&self) -> Json {
        match (&self.data, &self.message) {
            (Some(data), _) => data.clone(),
            (None, Some(message)) => Json::String(message.clone()),
            (None, None) => Json::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub task_id: String,
    pub function_name: String,
    pub function_label: String,
    pub function_kind: String,
    pub status: LogStatus,
    pub request: Json,
    pub response: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: NewLogEntry,
}
