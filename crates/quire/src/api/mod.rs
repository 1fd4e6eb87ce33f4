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

pub mod auth;

use crate::error::{RegistryError, StoreError};
use crate::keys::{ApiKeySummary, IssuedKey};
use crate::model::{ExecutionRequest, SaveFunction, ValidationResult};
use crate::Engine;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// An error body `{ "error": message }` with its status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::BadRequest(_) | RegistryError::NameConflict(_) | RegistryError::AdmissionRejected(_) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Storage(e) => {
                error!(error = %e, "Function store failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(engine: Arc<Engine>) -> Router {
    let execution = Router::new()
        .route("/v1/process", post(process))
        .route("/v1/functions/public", get(public_functions))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&engine), auth::require_api_key));

    let client = Router::new()
        .route("/v1/sheets-client/settings", get(public_settings))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&engine), auth::require_client_key));

    let admin = Router::new()
        .route("/v1/functions", get(list_functions).post(save_function))
        .route("/v1/functions/validate", post(validate_function))
        .route("/v1/functions/action", post(function_action))
        .route("/v1/logs", get(logs))
        .route("/v1/logs/action", post(logs_action))
        .route("/v1/settings", get(settings).post(update_settings))
        .route("/v1/api-keys", get(list_api_keys).post(create_api_key))
        .route("/v1/api-keys/action", post(api_key_action))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&engine), auth::require_admin));

    execution.merge(client).merge(admin).with_state(engine)
}

pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(local = %listener.local_addr()?, "Quire API listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
        })
        .await
}

async fn process(State(engine): State<Arc<Engine>>, body: Bytes) -> Response {
    // Malformed bodies are answered like empty ones so they are still logged.
    let request: ExecutionRequest = serde_json::from_slice(&body).unwrap_or_default();
    let response = engine.process(request).await;
    let status = if response.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (status, Json(response)).into_response()
}

async fn public_functions(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.registry().public_functions()).into_response()
}

async fn list_functions(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.registry().list()).into_response()
}

async fn save_function(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResult<Response> {
    let request: SaveFunction = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Function name and code are required"))?;
    let saved = engine.save_function(request).await?;
    Ok(Json(saved).into_response())
}

async fn validate_function(State(engine): State<Arc<Engine>>, body: Bytes) -> Json<ValidationResult> {
    let request: SaveFunction = serde_json::from_slice(&body).unwrap_or_default();
    Json(engine.validate_function(&request).await)
}

#[derive(Debug, Default, Deserialize)]
struct ActionRequest {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    id: Option<Value>,
}

fn parse_action(body: &[u8]) -> ApiResult<(String, ActionRequest)> {
    let request: ActionRequest = serde_json::from_slice(body).unwrap_or_default();
    let action = request
        .action
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ApiError::bad_request("Action is required"))?
        .to_string();
    Ok((action, request))
}

async fn function_action(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResult<Response> {
    let (action, request) = parse_action(&body)?;
    if action != "delete" {
        return Err(ApiError::bad_request("Invalid action"));
    }
    let name = match &request.id {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(ApiError::bad_request("Function name is required")),
    };
    engine.delete_function(&name).await?;
    Ok(Json(json!({ "message": "Function deleted successfully" })).into_response())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "first_page")]
    page: usize,
    #[serde(default = "default_per_page")]
    per_page: usize,
    #[serde(default)]
    group_by_task_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

const fn first_page() -> usize {
    1
}

const fn default_per_page() -> usize {
    20
}

fn truthy(flag: Option<&str>) -> bool {
    matches!(
        flag.map(|f| f.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

async fn logs(State(engine): State<Arc<Engine>>, Query(query): Query<LogsQuery>) -> Response {
    let audit = engine.audit();
    if let Some(task_id) = query.task_id.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return Json(json!({
            "logs": audit.entries_for_task(task_id),
            "task_id": task_id,
        }))
        .into_response();
    }
    if truthy(query.group_by_task_id.as_deref()) {
        Json(audit.grouped_page(query.page, query.per_page)).into_response()
    } else {
        Json(audit.page(query.page, query.per_page)).into_response()
    }
}

async fn logs_action(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResult<Response> {
    let (action, _) = parse_action(&body)?;
    if action != "clear" {
        return Err(ApiError::bad_request("Invalid action"));
    }
    engine.audit().clear().await.map_err(|e| {
        error!(error = %e, "Failed to clear audit journal");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear logs")
    })?;
    Ok(Json(json!({ "message": "Logs cleared successfully" })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct SettingsUpdate {
    #[serde(default, alias = "plugin_enabled")]
    enabled: Option<bool>,
}

fn store_failure(what: &'static str) -> impl Fn(StoreError) -> ApiError {
    move |e| {
        error!(error = %e, "Failed to persist {what}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to save {what}"))
    }
}

async fn settings(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(json!({ "enabled": engine.enabled() }))
}

async fn update_settings(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResult<Json<Value>> {
    let update: SettingsUpdate = serde_json::from_slice(&body).unwrap_or_default();
    if let Some(enabled) = update.enabled {
        engine.set_enabled(enabled).await.map_err(store_failure("settings"))?;
    }
    Ok(Json(json!({ "enabled": engine.enabled() })))
}

async fn public_settings(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(json!({ "plugin_enabled": engine.enabled() }))
}

async fn list_api_keys(State(engine): State<Arc<Engine>>) -> Json<Vec<ApiKeySummary>> {
    Json(engine.keys().list())
}

#[derive(Debug, Default, Deserialize)]
struct NewApiKey {
    #[serde(default)]
    name: Option<String>,
}

async fn create_api_key(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResult<Json<IssuedKey>> {
    let request: NewApiKey = serde_json::from_slice(&body).unwrap_or_default();
    let issued = engine
        .keys()
        .create(request.name.as_deref().unwrap_or_default())
        .await
        .map_err(store_failure("API key"))?;
    Ok(Json(issued))
}

async fn api_key_action(State(engine): State<Arc<Engine>>, body: Bytes) -> ApiResult<Response> {
    let (action, request) = parse_action(&body)?;
    if action != "delete" {
        return Err(ApiError::bad_request("Invalid action"));
    }
    let id = match &request.id {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(ApiError::bad_request("API key ID is required")),
    };
    let deleted = engine.keys().delete(&id).await.map_err(store_failure("API keys"))?;
    if !deleted {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "API key not found"));
    }
    Ok(Json(json!({ "message": "API key deleted successfully" })).into_response())
}
