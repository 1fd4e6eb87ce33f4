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

//! Turns one `/process` request into invocations and exactly one audit
//! entry. Validation failures are answered and logged like any other call.

use crate::audit::AuditLog;
use crate::executor::Executor;
use crate::hooks::{CustomKindHandler, DispatchHooks};
use crate::logging;
use crate::model::{DispatchResponse, ExecutionRequest, FunctionDefinition, FunctionKind, LogStatus, NewLogEntry};
use crate::registry::FunctionRegistry;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{span, Instrument, Level};

pub struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    executor: Arc<Executor>,
    audit: Arc<dyn AuditLog>,
    hooks: DispatchHooks,
    custom: Vec<Arc<dyn CustomKindHandler>>,
    batch_concurrency: usize,
}

/// Identity used for logging when no stored function matched.
struct Subject {
    name: String,
    label: String,
    kind: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<FunctionRegistry>, executor: Arc<Executor>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            registry,
            executor,
            audit,
            hooks: DispatchHooks::default(),
            custom: Vec::new(),
            batch_concurrency: 1,
        }
    }

    pub fn with_hooks(mut self, hooks: DispatchHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_custom_handler(mut self, handler: Arc<dyn CustomKindHandler>) -> Self {
        self.custom.push(handler);
        self
    }

    pub fn with_batch_concurrency(mut self, limit: usize) -> Self {
        self.batch_concurrency = limit.max(1);
        self
    }

    pub async fn dispatch(&self, request: ExecutionRequest) -> DispatchResponse {
        let task_id = non_empty(request.task_id.as_deref());
        let method = non_empty(request.method.as_deref());
        let kind = non_empty(request.kind.as_deref());

        let params = self.hooks.transform_params(&request, request.params.clone());
        let meta = self.hooks.transform_meta(&request, decode_meta(request.meta.clone()));

        let mut subject = Subject {
            name: method.unwrap_or_default().to_string(),
            label: method.unwrap_or_default().to_string(),
            kind: kind.unwrap_or_default().to_string(),
        };
        let response = match (task_id, method, kind) {
            (None, _, _) => DispatchResponse::error("Missing required parameter: task_id"),
            (_, None, _) | (_, _, None) => DispatchResponse::error("Missing required parameters: method and type"),
            (Some(_), Some(method), Some(kind)) => match self.resolve(method, kind, params.as_ref()) {
                Err(message) => DispatchResponse::error(message),
                Ok(function) => {
                    subject = Subject {
                        name: function.name.clone(),
                        label: function.label.clone(),
                        kind: function.kind.to_string(),
                    };
                    self.run(&request, &function, params.clone()).await
                }
            },
        };
        let response = self.hooks.transform_response(&request, response);

        logging::log_dispatch(task_id.unwrap_or_default(), &subject.name, &subject.kind, &response);
        let entry = NewLogEntry {
            task_id: task_id.unwrap_or_default().to_string(),
            function_name: subject.name,
            function_label: subject.label,
            function_kind: subject.kind,
            status: if response.success { LogStatus::Success } else { LogStatus::Error },
            request: params.unwrap_or(Value::Null),
            response: response.snapshot(),
            meta: meta.as_ref().and_then(project_meta),
        };
        if let Err(e) = self.audit.append(entry).await {
            logging::log_audit_failure(task_id.unwrap_or_default(), &e);
        }
        response
    }

    fn claimed(&self, kind: &str) -> bool {
        FunctionKind::from(kind).is_built_in() || self.custom.iter().any(|h| h.claims(kind))
    }

    fn resolve(&self, method: &str, kind: &str, params: Option<&Value>) -> Result<FunctionDefinition, String> {
        match FunctionKind::from(kind) {
            FunctionKind::BatchRecord if !params.and_then(Value::as_array).is_some_and(|p| !p.is_empty()) => {
                return Err("Invalid params parameter. Expected: array".into());
            }
            FunctionKind::PagedImport if !params.is_some_and(Value::is_object) => {
                return Err("Invalid params parameter. Expected: object".into());
            }
            _ => {}
        }
        if !self.claimed(kind) {
            return Err("Invalid type parameter".into());
        }
        let function = self
            .registry
            .get(method)
            .ok_or_else(|| format!("Function '{method}' not found"))?;
        if function.kind.as_str() != kind {
            return Err(format!("Function '{method}' is not a {kind} function"));
        }
        Ok(function)
    }

    async fn run(&self, request: &ExecutionRequest, function: &FunctionDefinition, params: Option<Value>) -> DispatchResponse {
        match &function.kind {
            FunctionKind::BatchRecord => {
                let records = match params {
                    Some(Value::Array(records)) => records,
                    _ => Vec::new(),
                };
                self.batch(function, records).await
            }
            FunctionKind::PagedImport => {
                let params = params.unwrap_or(Value::Null);
                let index = params.get("index");
                if !index.is_some_and(Value::is_number) && index.is_none_or_empty() {
                    return DispatchResponse::error("Missing required parameter: index");
                }
                if !params.get("batchSize").is_some_and(is_positive) {
                    return DispatchResponse::error("Missing required parameter: batchSize");
                }
                self.single(function, Some(params)).await
            }
            FunctionKind::OneShotTrigger => self.single(function, params).await,
            FunctionKind::Custom(kind) => {
                for handler in self.custom.iter().filter(|h| h.claims(kind)) {
                    if let Some(response) = handler.handle(request, function, &self.executor).await {
                        return response;
                    }
                }
                DispatchResponse::error("Invalid type parameter")
            }
        }
    }

    async fn single(&self, function: &FunctionDefinition, params: Option<Value>) -> DispatchResponse {
        match self.executor.invoke(function, params).await {
            Ok(data) => DispatchResponse::success(data),
            Err(failure) => DispatchResponse::error(failure.message),
        }
    }

    async fn batch(&self, function: &FunctionDefinition, records: Vec<Value>) -> DispatchResponse {
        let identifiers: Vec<Option<&Value>> = records.iter().map(|r| r.get("identifier")).collect();

        let mut seen = HashSet::new();
        let unique = identifiers
            .iter()
            .flatten()
            .all(|id| seen.insert(identifier_text(id)));
        if !unique {
            return DispatchResponse::error("Identifiers in records are not unique");
        }
        if identifiers.iter().any(|id| id.is_none_or_empty()) {
            return DispatchResponse::error("Missing identifier in one or more records");
        }

        let results: Vec<Value> = futures::stream::iter(records)
            .map(|record| {
                let identifier = record.get("identifier").cloned().unwrap_or(Value::Null);
                let record_span = span!(Level::DEBUG, "batch_record", identifier = %identifier_text(&identifier));
                async move {
                    match self.executor.invoke(function, Some(record)).await {
                        Ok(result) => merge_identifier(result, identifier),
                        Err(failure) => json!({
                            "identifier": identifier,
                            "success": false,
                            "message": failure.message,
                        }),
                    }
                }
                .instrument(record_span)
            })
            .buffered(self.batch_concurrency)
            .collect()
            .await;

        DispatchResponse::success(Value::Array(results))
    }
}

trait Emptiness {
    fn is_none_or_empty(&self) -> bool;
}

/// Absent, null, false, zero, `""`, `"0"` and empty containers all count
/// as missing.
impl Emptiness for Option<&Value> {
    fn is_none_or_empty(&self) -> bool {
        match self {
            None | Some(Value::Null) | Some(Value::Bool(false)) => true,
            Some(Value::Number(n)) => n.as_f64() == Some(0.0),
            Some(Value::String(s)) => s.is_empty() || s == "0",
            Some(Value::Array(a)) => a.is_empty(),
            Some(Value::Object(o)) => o.is_empty(),
            Some(Value::Bool(true)) => false,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn is_positive(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|n| n > 0.0),
        Value::String(s) => s.trim().parse::<f64>().is_ok_and(|n| n > 0.0),
        _ => false,
    }
}

fn identifier_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Object results gain the record's identifier; lists become index-keyed
/// objects and anything else is reported as `message`.
fn merge_identifier(result: Value, identifier: Value) -> Value {
    let mut merged = match result {
        Value::Object(map) => map,
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect::<Map<String, Value>>(),
        scalar => {
            let mut map = Map::new();
            map.insert("message".into(), scalar);
            map
        }
    };
    merged.insert("identifier".into(), identifier);
    Value::Object(merged)
}

/// Caller metadata may arrive as an object or as JSON text.
fn decode_meta(meta: Option<Value>) -> Option<Value> {
    match meta {
        Some(Value::String(text)) => serde_json::from_str(&text).ok(),
        other => other,
    }
}

/// Only the caller's identity is kept from `meta`.
fn project_meta(meta: &Value) -> Option<Value> {
    let user = meta.get("user")?;
    let profile = user.get("profile")?;
    let field = |value: Option<&Value>| value.cloned().unwrap_or_else(|| json!(""));
    Some(json!({
        "user": {
            "id": field(profile.get("id")),
            "name": field(profile.get("name")),
            "email": field(user.get("email")),
            "picture": field(profile.get("picture")),
        }
    }))
}
