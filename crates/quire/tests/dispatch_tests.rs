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

use async_trait::async_trait;
use quire::{
    AuditJournal, CustomKindHandler, DispatchHooks, DispatchResponse, Engine, ExecutionHooks, ExecutionObserver,
    ExecutionRequest, Executor, Extensions, FunctionDefinition, FunctionKind, LogStatus, MemoryFunctionStore,
    QuireConfig, RegistryError, SaveFunction,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const ENRICH: &str = r#"function enrich($record) {
    if ($record['identifier'] === 'boom') {
        throw new InvalidArgumentException('bad record ' . $record['identifier']);
    }
    $record['name'] = strtoupper($record['name']);
    return $record;
}"#;

const PAGE_ROWS: &str = r#"function page_rows($record) {
    $rows = [];
    for ($i = 0; $i < $record['batchSize']; $i++) {
        $rows[] = ['row' => $record['index'] + $i];
    }
    return $rows;
}"#;

const PING: &str = "function ping($record = null) { return $record === null ? 'pong' : count($record); }";

async fn engine_with(config: QuireConfig, extensions: Extensions) -> Engine {
    Engine::with_extensions(
        config,
        Arc::new(MemoryFunctionStore::new()),
        Arc::new(AuditJournal::in_memory(None)),
        extensions,
    )
    .await
    .unwrap()
}

async fn engine() -> Engine {
    engine_with(QuireConfig::default(), Extensions::default()).await
}

async fn save(engine: &Engine, name: &str, code: &str, kind: FunctionKind) -> FunctionDefinition {
    engine
        .save_function(SaveFunction {
            name: name.into(),
            code: code.into(),
            kind: Some(kind),
            ..SaveFunction::default()
        })
        .await
        .unwrap()
}

fn request(task_id: &str, method: &str, kind: &str, params: Value) -> ExecutionRequest {
    serde_json::from_value(json!({
        "task_id": task_id,
        "method": method,
        "type": kind,
        "params": params,
    }))
    .unwrap()
}

#[derive(Default)]
struct InvocationCounter(AtomicUsize);

impl ExecutionObserver for InvocationCounter {
    fn before_invoke(&self, _name: &str, _record: Option<&Value>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CompileCounter(AtomicUsize);

impl ExecutionObserver for CompileCounter {
    fn before_materialize(&self, _name: &str, _source: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn observed(observer: Arc<dyn ExecutionObserver>) -> Extensions {
    Extensions {
        execution: ExecutionHooks::new().with_observer(observer),
        ..Extensions::default()
    }
}

#[tokio::test]
async fn test_batch_keeps_order_and_isolates_failures() {
    let engine = engine().await;
    save(&engine, "enrich", ENRICH, FunctionKind::BatchRecord).await;

    let response = engine
        .process(request(
            "task-1",
            "enrich",
            "upload_to_website",
            json!([
                {"identifier": "a", "name": "ada"},
                {"identifier": "boom", "name": "x"},
                {"identifier": 3, "name": "cy"},
            ]),
        ))
        .await;

    assert!(response.success);
    assert_eq!(
        response.data,
        Some(json!([
            {"identifier": "a", "name": "ADA"},
            {"identifier": "boom", "success": false, "message": "Uncaught InvalidArgumentException: bad record boom"},
            {"identifier": 3, "name": "CY"},
        ]))
    );

    // The whole batch is one journal row holding the per-record results.
    let entries = engine.audit().entries_for_task("task-1");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry.status, LogStatus::Success);
    assert_eq!(entries[0].entry.function_kind, "upload_to_website");
    assert_eq!(Some(&entries[0].entry.response), response.data.as_ref());
    assert_eq!(entries[0].entry.request.as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn test_batch_identifier_checks_run_before_any_invocation() {
    let counter = Arc::new(InvocationCounter::default());
    let engine = engine_with(QuireConfig::default(), observed(counter.clone())).await;
    save(&engine, "enrich", ENRICH, FunctionKind::BatchRecord).await;

    let duplicate = engine
        .process(request(
            "t-dup",
            "enrich",
            "upload_to_website",
            json!([{"identifier": 1, "name": "a"}, {"identifier": "1", "name": "b"}]),
        ))
        .await;
    assert_eq!(duplicate.message.as_deref(), Some("Identifiers in records are not unique"));

    let missing = engine
        .process(request(
            "t-missing",
            "enrich",
            "upload_to_website",
            json!([{"identifier": "a", "name": "a"}, {"name": "b"}]),
        ))
        .await;
    assert_eq!(missing.message.as_deref(), Some("Missing identifier in one or more records"));

    assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    let rejected = engine.audit().entries_for_task("t-dup");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].entry.status, LogStatus::Error);
}

#[tokio::test]
async fn test_bounded_concurrency_preserves_input_order() {
    let mut config = QuireConfig::default();
    config.execution.batch_concurrency = 4;
    let engine = engine_with(config, Extensions::default()).await;
    save(&engine, "enrich", ENRICH, FunctionKind::BatchRecord).await;

    let records: Vec<Value> = (0..20).map(|i| json!({"identifier": format!("r{i}"), "name": "n"})).collect();
    let response = engine
        .process(request("t-par", "enrich", "upload_to_website", Value::Array(records)))
        .await;
    let ids: Vec<String> = response.data.unwrap().as_array().unwrap().iter().map(|r| r["identifier"].as_str().unwrap().to_string()).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("r{i}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_validation_messages_in_order() {
    let engine = engine().await;
    save(&engine, "enrich", ENRICH, FunctionKind::BatchRecord).await;
    save(&engine, "page_rows", PAGE_ROWS, FunctionKind::PagedImport).await;

    let cases = [
        (json!({"method": "enrich", "type": "upload_to_website", "params": [{}]}), "Missing required parameter: task_id"),
        (json!({"task_id": "t", "type": "upload_to_website"}), "Missing required parameters: method and type"),
        (json!({"task_id": "t", "method": "enrich", "type": "upload_to_website", "params": []}), "Invalid params parameter. Expected: array"),
        (json!({"task_id": "t", "method": "page_rows", "type": "import_to_sheet", "params": [1]}), "Invalid params parameter. Expected: object"),
        (json!({"task_id": "t", "method": "enrich", "type": "delete_everything"}), "Invalid type parameter"),
        (json!({"task_id": "t", "method": "nope", "type": "one_time_trigger"}), "Function 'nope' not found"),
        (json!({"task_id": "t", "method": "enrich", "type": "one_time_trigger"}), "Function 'enrich' is not a one_time_trigger function"),
    ];
    let total = cases.len();
    for (body, message) in cases {
        let response = engine.process(serde_json::from_value(body).unwrap()).await;
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some(message));
    }

    // One entry per call, including rejected ones.
    assert_eq!(engine.audit().len(), total);
    let fallback = &engine.audit().entries_for_task("t")[0].entry;
    assert_eq!(fallback.function_name, "enrich");
    assert_eq!(fallback.function_label, "enrich");
    assert_eq!(fallback.response, json!("Function 'enrich' is not a one_time_trigger function"));
}

#[tokio::test]
async fn test_paged_import() {
    let counter = Arc::new(InvocationCounter::default());
    let engine = engine_with(QuireConfig::default(), observed(counter.clone())).await;
    save(&engine, "page_rows", PAGE_ROWS, FunctionKind::PagedImport).await;

    let response = engine
        .process(request("t", "page_rows", "import_to_sheet", json!({"index": 0, "batchSize": 2})))
        .await;
    assert_eq!(response.data, Some(json!([{"row": 0}, {"row": 1}])));
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    let response = engine
        .process(request("t", "page_rows", "import_to_sheet", json!({"batchSize": 2})))
        .await;
    assert_eq!(response.message.as_deref(), Some("Missing required parameter: index"));

    let response = engine
        .process(request("t", "page_rows", "import_to_sheet", json!({"index": 10, "batchSize": 0})))
        .await;
    assert_eq!(response.message.as_deref(), Some("Missing required parameter: batchSize"));
    // Rejected pages never reach the function.
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_of_one_name_admit_one() {
    let engine = Arc::new(engine().await);
    let saves = (0..16).map(|i| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .save_function(SaveFunction {
                    name: "ping".into(),
                    label: Some(format!("Ping {i}")),
                    code: PING.into(),
                    kind: Some(FunctionKind::OneShotTrigger),
                    ..SaveFunction::default()
                })
                .await
        })
    });
    let outcomes: Vec<_> = futures::future::join_all(saves).await.into_iter().map(Result::unwrap).collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .all(|e| matches!(e, RegistryError::NameConflict(_))));
    assert_eq!(engine.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_compile_once() {
    let compiles = Arc::new(CompileCounter::default());
    let engine = Arc::new(engine_with(QuireConfig::default(), observed(compiles.clone())).await);
    save(&engine, "ping", PING, FunctionKind::OneShotTrigger).await;

    let calls = (0..32).map(|i| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .process(request(&format!("t-{i}"), "ping", "one_time_trigger", Value::Null))
                .await
        })
    });
    for response in futures::future::join_all(calls).await {
        let response = response.unwrap();
        assert!(response.success, "{:?}", response.message);
        assert_eq!(response.data, Some(json!("pong")));
    }

    assert_eq!(compiles.0.load(Ordering::SeqCst), 1);
    assert_eq!(engine.executor().cached(), 1);
    assert_eq!(engine.audit().len(), 32);
}

#[tokio::test]
async fn test_one_shot_trigger_with_and_without_params() {
    let engine = engine().await;
    save(&engine, "ping", PING, FunctionKind::OneShotTrigger).await;

    let without: ExecutionRequest =
        serde_json::from_value(json!({"task_id": "t", "method": "ping", "type": "one_time_trigger"})).unwrap();
    assert_eq!(engine.process(without).await.data, Some(json!("pong")));

    let with = request("t", "ping", "one_time_trigger", json!({"a": 1, "b": 2}));
    assert_eq!(engine.process(with).await.data, Some(json!(2)));
}

#[tokio::test]
async fn test_meta_projection_is_logged() {
    let engine = engine().await;
    save(&engine, "ping", PING, FunctionKind::OneShotTrigger).await;
    let meta = json!({"user": {"email": "ada@example.com", "profile": {"id": "u1", "name": "Ada"}, "token": "x"}});
    let request: ExecutionRequest = serde_json::from_value(json!({
        "task_id": "t-meta",
        "method": "ping",
        "type": "one_time_trigger",
        "meta": meta.to_string(),
    }))
    .unwrap();
    engine.process(request).await;

    let entry = &engine.audit().entries_for_task("t-meta")[0].entry;
    assert_eq!(
        entry.meta,
        Some(json!({"user": {"id": "u1", "name": "Ada", "email": "ada@example.com", "picture": ""}}))
    );
}

struct Mailer;

#[async_trait]
impl CustomKindHandler for Mailer {
    fn claims(&self, kind: &str) -> bool {
        kind == "send_email"
    }

    async fn handle(
        &self,
        request: &ExecutionRequest,
        function: &FunctionDefinition,
        executor: &Executor,
    ) -> Option<DispatchResponse> {
        Some(match executor.invoke(function, request.params.clone()).await {
            Ok(body) => DispatchResponse::success(json!({ "sent": body })),
            Err(failure) => DispatchResponse::error(failure.message),
        })
    }
}

#[tokio::test]
async fn test_custom_kind_handler() {
    let extensions = Extensions {
        custom_kinds: vec![Arc::new(Mailer)],
        ..Extensions::default()
    };
    let engine = engine_with(QuireConfig::default(), extensions).await;
    save(
        &engine,
        "compose",
        "function compose($record) { return 'Hello ' . $record['to']; }",
        FunctionKind::Custom("send_email".into()),
    )
    .await;

    let response = engine
        .process(request("t", "compose", "send_email", json!({"to": "Ada"})))
        .await;
    assert_eq!(response.data, Some(json!({"sent": "Hello Ada"})));

    let response = engine
        .process(request("t", "compose", "send_sms", json!({"to": "Ada"})))
        .await;
    assert_eq!(response.message.as_deref(), Some("Invalid type parameter"));
}

#[tokio::test]
async fn test_dispatch_hooks_shape_params_and_response() {
    let extensions = Extensions {
        dispatch: DispatchHooks::new()
            .with_params_transform(|_, params| params.map(|p| json!({"wrapped": p})))
            .with_response_transform(|request, mut response| {
                if let Some(task) = &request.task_id {
                    response.data = response.data.map(|d| json!({"task": task, "result": d}));
                }
                response
            }),
        ..Extensions::default()
    };
    let engine = engine_with(QuireConfig::default(), extensions).await;
    save(&engine, "ping", PING, FunctionKind::OneShotTrigger).await;

    let response = engine
        .process(request("t-hook", "ping", "one_time_trigger", json!({"a": 1, "b": 2})))
        .await;
    assert_eq!(response.data, Some(json!({"task": "t-hook", "result": 1})));
    assert_eq!(engine.audit().entries_for_task("t-hook")[0].entry.request, json!({"wrapped": {"a": 1, "b": 2}}));
}

#[tokio::test]
async fn test_updates_and_deletes_reach_the_executor() {
    let engine = engine().await;
    let saved = save(&engine, "ping", PING, FunctionKind::OneShotTrigger).await;
    engine.process(request("t", "ping", "one_time_trigger", json!({}))).await;
    assert_eq!(engine.executor().cached(), 1);

    engine
        .save_function(SaveFunction {
            id: Some(saved.id.to_string()),
            name: "ping".into(),
            code: "function ping($record = null) { return 'pong v2'; }".into(),
            kind: Some(FunctionKind::OneShotTrigger),
            ..SaveFunction::default()
        })
        .await
        .unwrap();
    assert_eq!(engine.executor().cached(), 0);
    let without: ExecutionRequest =
        serde_json::from_value(json!({"task_id": "t", "method": "ping", "type": "one_time_trigger"})).unwrap();
    assert_eq!(engine.process(without.clone()).await.data, Some(json!("pong v2")));

    engine.delete_function("ping").await.unwrap();
    assert_eq!(engine.executor().cached(), 0);
    assert_eq!(engine.process(without).await.message.as_deref(), Some("Function 'ping' not found"));
}
