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

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use quire::{AuditJournal, Engine, MemoryFunctionStore, QuireConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ENRICH: &str = "function enrich($record) { $record['seen'] = true; return $record; }";

async fn app() -> (Arc<Engine>, Router) {
    let mut config = QuireConfig::default();
    config.auth.admin_token = Some("admin-secret".into());
    config.auth.api_keys = vec!["key-1".into()];
    let engine = Arc::new(
        Engine::new(
            config,
            Arc::new(MemoryFunctionStore::new()),
            Arc::new(AuditJournal::in_memory(None)),
        )
        .await
        .unwrap(),
    );
    let router = quire::api::router(Arc::clone(&engine));
    (engine, router)
}

fn admin(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, "Bearer admin-secret")
        .header(header::CONTENT_TYPE, "application/json");
    builder
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap()
}

fn execution(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("x-api-key", "key-1")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

async fn save_enrich(router: &Router) -> Value {
    let (status, body) = call(
        router,
        admin(
            Method::POST,
            "/v1/functions",
            Some(json!({"name": "enrich", "label": "Enrich", "code": ENRICH, "type": "upload_to_website"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let (_, router) = app().await;

    let anonymous = Request::builder().uri("/v1/functions").body(Body::empty()).unwrap();
    let (status, body) = call(&router, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Not authorized"}));

    let wrong = Request::builder()
        .uri("/v1/settings")
        .header(header::AUTHORIZATION, "Bearer key-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&router, wrong).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_execution_routes_require_key_and_enabled_flag() {
    let (engine, router) = app().await;

    let keyless = Request::builder()
        .method(Method::POST)
        .uri("/v1/process")
        .body(Body::from("{}"))
        .unwrap();
    assert_eq!(call(&router, keyless).await.0, StatusCode::UNAUTHORIZED);

    let bearer = Request::builder()
        .uri("/v1/functions/public")
        .header(header::AUTHORIZATION, "Bearer key-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&router, bearer).await, (StatusCode::OK, json!([])));

    engine.set_enabled(false).await.unwrap();
    let (status, body) = call(&router, execution("/v1/process", json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "Functionality is disabled from the plugin settings."}));
    // Rejected before dispatch, so nothing is journaled.
    assert!(engine.audit().is_empty());
}

#[tokio::test]
async fn test_save_list_and_public_listing() {
    let (_, router) = app().await;
    let saved = save_enrich(&router).await;
    assert_eq!(saved["name"], "enrich");
    assert_eq!(saved["type"], "upload_to_website");
    assert!(saved["id"].as_str().is_some());

    let (_, listed) = call(&router, admin(Method::GET, "/v1/functions", None)).await;
    assert_eq!(listed[0]["code"], ENRICH);

    let public = Request::builder()
        .uri("/v1/functions/public")
        .header("x-api-key", "key-1")
        .body(Body::empty())
        .unwrap();
    let (_, public) = call(&router, public).await;
    assert_eq!(public, json!([{"name": "enrich", "label": "Enrich", "type": "upload_to_website"}]));
}

#[tokio::test]
async fn test_save_rejections() {
    let (_, router) = app().await;

    let (status, body) = call(&router, admin(Method::POST, "/v1/functions", Some(json!({"name": "enrich"})))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Function name and code are required"}));

    let (status, body) = call(
        &router,
        admin(
            Method::POST,
            "/v1/functions",
            Some(json!({"name": "run", "code": "function run($record) { exec('ls'); return $record; }"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("exec"), "{body}");

    save_enrich(&router).await;
    let (status, body) = call(
        &router,
        admin(Method::POST, "/v1/functions", Some(json!({"name": "enrich", "code": ENRICH}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"error": "Function name 'enrich' is already in use by another saved function."})
    );
}

#[tokio::test]
async fn test_validate_always_answers_ok() {
    let (_, router) = app().await;

    let (status, body) = call(
        &router,
        admin(Method::POST, "/v1/functions/validate", Some(json!({"name": "enrich", "code": ENRICH}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["message"], "Function code is valid.");

    let (status, body) = call(
        &router,
        admin(
            Method::POST,
            "/v1/functions/validate",
            Some(json!({"name": "enrich", "code": "function enrich($record) { return $$record; }"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn test_function_actions() {
    let (_, router) = app().await;
    save_enrich(&router).await;

    let cases = [
        (json!({}), StatusCode::BAD_REQUEST, json!({"error": "Action is required"})),
        (json!({"action": "rename", "id": "enrich"}), StatusCode::BAD_REQUEST, json!({"error": "Invalid action"})),
        (json!({"action": "delete"}), StatusCode::BAD_REQUEST, json!({"error": "Function name is required"})),
        (json!({"action": "delete", "id": "missing"}), StatusCode::NOT_FOUND, json!({"error": "Function not found"})),
        (
            json!({"action": "delete", "id": "enrich"}),
            StatusCode::OK,
            json!({"message": "Function deleted successfully"}),
        ),
    ];
    for (body, status, expected) in cases {
        let answer = call(&router, admin(Method::POST, "/v1/functions/action", Some(body))).await;
        assert_eq!(answer, (status, expected));
    }

    let (_, listed) = call(&router, admin(Method::GET, "/v1/functions", None)).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_process_status_codes_and_logs() {
    let (_, router) = app().await;
    save_enrich(&router).await;

    let ok = json!({
        "task_id": "t-1",
        "method": "enrich",
        "type": "upload_to_website",
        "params": [{"identifier": "a"}],
        "meta": {"user": {"email": "ada@example.com", "profile": {"id": 1, "name": "Ada", "picture": "p"}}},
    });
    let (status, body) = call(&router, execution("/v1/process", ok)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "data": [{"identifier": "a", "seen": true}]}));

    let (status, body) = call(&router, execution("/v1/process", json!({"task_id": "t-2"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"success": false, "message": "Missing required parameters: method and type"}));

    let malformed = Request::builder()
        .method(Method::POST)
        .uri("/v1/process")
        .header("x-api-key", "key-1")
        .body(Body::from("not json"))
        .unwrap();
    let (status, body) = call(&router, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Missing required parameter: task_id");

    let (_, page) = call(&router, admin(Method::GET, "/v1/logs?page=1&per_page=2", None)).await;
    assert_eq!(page["total"], 3);
    assert_eq!(page["pages"], 2);
    assert_eq!(page["logs"].as_array().unwrap().len(), 2);

    let (_, task) = call(&router, admin(Method::GET, "/v1/logs?task_id=t-1", None)).await;
    assert_eq!(task["task_id"], "t-1");
    let entry = &task["logs"][0];
    assert_eq!(entry["status"], "success");
    assert_eq!(entry["function_label"], "Enrich");
    assert_eq!(entry["meta"]["user"]["email"], "ada@example.com");

    let (_, grouped) = call(&router, admin(Method::GET, "/v1/logs?group_by_task_id=true", None)).await;
    assert_eq!(grouped["grouped"], true);
    assert_eq!(grouped["total"], 3);

    let (status, body) = call(&router, admin(Method::POST, "/v1/logs/action", Some(json!({"action": "clear"})))).await;
    assert_eq!((status, body), (StatusCode::OK, json!({"message": "Logs cleared successfully"})));
    let (_, page) = call(&router, admin(Method::GET, "/v1/logs", None)).await;
    assert_eq!(page["total"], 0);
}

#[tokio::test]
async fn test_settings_toggle() {
    let (engine, router) = app().await;
    assert_eq!(call(&router, admin(Method::GET, "/v1/settings", None)).await.1, json!({"enabled": true}));

    let (_, body) = call(&router, admin(Method::POST, "/v1/settings", Some(json!({"enabled": false})))).await;
    assert_eq!(body, json!({"enabled": false}));
    assert!(!engine.enabled());

    // Unknown fields leave the flag alone.
    let (_, body) = call(&router, admin(Method::POST, "/v1/settings", Some(json!({"other": 1})))).await;
    assert_eq!(body, json!({"enabled": false}));
}

fn keyed_get(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", key)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_api_key_lifecycle() {
    let (_, router) = app().await;
    assert_eq!(call(&router, admin(Method::GET, "/v1/api-keys", None)).await.1, json!([]));

    let (status, issued) = call(&router, admin(Method::POST, "/v1/api-keys", Some(json!({"name": "Sheets"})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issued["name"], "Sheets");
    let secret = issued["key"].as_str().unwrap().to_string();
    let id = issued["id"].as_str().unwrap().to_string();

    let (_, listed) = call(&router, admin(Method::GET, "/v1/api-keys", None)).await;
    assert_eq!(listed[0]["id"], id.as_str());
    assert!(listed[0].get("key").is_none());

    // An issued key opens the execution routes like a configured one.
    let (status, _) = call(&router, keyed_get("/v1/functions/public", &secret)).await;
    assert_eq!(status, StatusCode::OK);

    let action = |body: Value| admin(Method::POST, "/v1/api-keys/action", Some(body));
    let (status, body) = call(&router, action(json!({"id": id}))).await;
    assert_eq!((status, body), (StatusCode::BAD_REQUEST, json!({"error": "Action is required"})));
    let (status, body) = call(&router, action(json!({"action": "rotate", "id": id}))).await;
    assert_eq!((status, body), (StatusCode::BAD_REQUEST, json!({"error": "Invalid action"})));
    let (status, body) = call(&router, action(json!({"action": "delete"}))).await;
    assert_eq!((status, body), (StatusCode::BAD_REQUEST, json!({"error": "API key ID is required"})));

    let (status, body) = call(&router, action(json!({"action": "delete", "id": id}))).await;
    assert_eq!((status, body), (StatusCode::OK, json!({"message": "API key deleted successfully"})));
    let (status, body) = call(&router, action(json!({"action": "delete", "id": id}))).await;
    assert_eq!((status, body), (StatusCode::NOT_FOUND, json!({"error": "API key not found"})));

    let (status, _) = call(&router, keyed_get("/v1/functions/public", &secret)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_api_key_routes_are_admin_only() {
    let (_, router) = app().await;
    let (status, _) = call(&router, keyed_get("/v1/api-keys", "key-1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_client_settings_stay_readable_while_disabled() {
    let (engine, router) = app().await;
    let (status, body) = call(&router, keyed_get("/v1/sheets-client/settings", "key-1")).await;
    assert_eq!((status, body), (StatusCode::OK, json!({"plugin_enabled": true})));

    engine.set_enabled(false).await.unwrap();
    let (status, body) = call(&router, keyed_get("/v1/sheets-client/settings", "key-1")).await;
    assert_eq!((status, body), (StatusCode::OK, json!({"plugin_enabled": false})));

    let (status, _) = call(&router, keyed_get("/v1/sheets-client/settings", "wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_settings_and_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = QuireConfig::default();
    config.auth.admin_token = Some("admin-secret".into());
    config.storage.settings_path = Some(dir.path().join("settings.json"));
    config.storage.keys_path = Some(dir.path().join("keys.json"));

    let engine = Arc::new(Engine::from_config(config.clone()).await.unwrap());
    let router = quire::api::router(Arc::clone(&engine));
    call(&router, admin(Method::POST, "/v1/settings", Some(json!({"enabled": false})))).await;
    let (_, issued) = call(&router, admin(Method::POST, "/v1/api-keys", Some(json!({})))).await;
    drop(router);
    drop(engine);

    let engine = Arc::new(Engine::from_config(config).await.unwrap());
    assert!(!engine.enabled());
    assert!(engine.keys().accepts(issued["key"].as_str().unwrap()));
    let router = quire::api::router(engine);
    let (_, body) = call(&router, admin(Method::GET, "/v1/settings", None)).await;
    assert_eq!(body, json!({"enabled": false}));
}
