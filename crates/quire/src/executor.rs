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

//! Runs admitted functions. Sources are parsed once per (name, source)
//! pair and every call gets a fresh interpreter on the blocking pool.

use crate::config::ExecutionConfig;
use crate::error::ExecutionFailure;
use crate::hooks::ExecutionHooks;
use crate::logging;
use crate::model::FunctionDefinition;
use crate::script::{parse, Interpreter, Limits, Program, RuntimeError, Value};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

type Slot = Arc<OnceCell<Result<Arc<Program>, ExecutionFailure>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    name: String,
    digest: String,
}

pub struct Executor {
    slots: DashMap<SlotKey, Slot>,
    limits: Limits,
    timeout: Duration,
    hooks: ExecutionHooks,
}

impl Executor {
    pub fn new(config: &ExecutionConfig, hooks: ExecutionHooks) -> Self {
        Self {
            slots: DashMap::new(),
            limits: config.limits(),
            timeout: config.timeout(),
            hooks,
        }
    }

    pub fn hooks(&self) -> &ExecutionHooks {
        &self.hooks
    }

    /// Drops every compiled form of `name`.
    pub fn forget(&self, name: &str) {
        self.slots.retain(|key, _| key.name != name);
        debug!(function = name, "Evicted compiled function");
    }

    pub fn cached(&self) -> usize {
        self.slots.len()
    }

    pub async fn invoke(&self, function: &FunctionDefinition, record: Option<Json>) -> Result<Json, ExecutionFailure> {
        let name = function.name.as_str();
        let outcome = self.run(function, record.clone()).await;
        if let Err(failure) = &outcome {
            logging::log_execution_failure(name, &failure.message);
            self.hooks
                .notify(|observer| observer.on_failure(name, record.as_ref(), failure));
        }
        outcome
    }

    async fn run(&self, function: &FunctionDefinition, record: Option<Json>) -> Result<Json, ExecutionFailure> {
        let name = function.name.trim();
        if function.source.trim().is_empty() {
            return Err(ExecutionFailure::new(format!("Function {name} is empty")));
        }
        if name.is_empty() {
            return Err(ExecutionFailure::new("Function name is empty"));
        }
        if record.as_ref().is_some_and(|r| !r.is_object() && !r.is_array()) {
            return Err(ExecutionFailure::new(format!("Function {name} expects an array as parameter")));
        }
        if !self.hooks.should_execute(name, record.as_ref()) {
            return Err(ExecutionFailure::new("Function execution prevented by hook"));
        }

        let record = self.hooks.transform_params(name, record);
        self.hooks
            .notify(|observer| observer.before_invoke(name, record.as_ref()));

        let program = self.materialize(name, &function.source)?;
        let started = Instant::now();
        let result = self.call(program, name, record.as_ref()).await?;
        let result = self.hooks.transform_result(name, record.as_ref(), result);

        self.hooks
            .notify(|observer| observer.after_invoke(name, record.as_ref(), &result));
        debug!(
            function = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invocation finished"
        );
        Ok(result)
    }

    fn materialize(&self, name: &str, source: &str) -> Result<Arc<Program>, ExecutionFailure> {
        let key = SlotKey {
            name: name.to_string(),
            digest: format!("{:x}", md5::compute(source.as_bytes())),
        };
        let slot = Arc::clone(self.slots.entry(key).or_default().value());

        slot.get_or_init(|| {
            self.hooks
                .notify(|observer| observer.before_materialize(name, source));
            let created = match parse(source) {
                Ok(program) if program.function(name).is_some() => Ok(Arc::new(program)),
                Ok(_) => Err(ExecutionFailure::new(format!("Function {name} could not be created"))),
                Err(e) => {
                    error!(function = name, error = %e, "Stored function no longer parses");
                    Err(ExecutionFailure::new(format!("Function {name} could not be created")))
                }
            };
            if created.is_ok() {
                self.hooks.notify(|observer| observer.after_materialize(name));
            }
            created
        })
        .clone()
    }

    async fn call(&self, program: Arc<Program>, name: &str, record: Option<&Json>) -> Result<Json, ExecutionFailure> {
        let args: Vec<Value> = record.map(Value::from_json).into_iter().collect();
        let limits = self.limits.with_time_budget(self.timeout);
        let entry = name.to_string();

        let task = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut interpreter = Interpreter::new(&program, limits);
            let result = interpreter.call(&entry, args);
            if !interpreter.output().is_empty() {
                debug!(function = %entry, bytes = interpreter.output().len(), "Discarded function output");
            }
            logging::log_execution(&entry, started.elapsed(), interpreter.gas_used());
            result.map(|value| value.to_json())
        });

        // The interpreter stops itself at the deadline; this only guards
        // against a task that never reaches a gas check.
        let grace = self.timeout + Duration::from_millis(250);
        match tokio::time::timeout(grace, task).await {
            Err(_) => Err(ExecutionFailure::new("Function execution timeout")),
            Ok(Err(join)) if join.is_panic() => {
                error!(function = name, "Function execution panicked");
                Err(ExecutionFailure::new("Function execution panicked"))
            }
            Ok(Err(join)) => Err(ExecutionFailure::new(join.to_string())),
            Ok(Ok(Err(RuntimeError::DeadlineExceeded))) => Err(ExecutionFailure::new("Function execution timeout")),
            Ok(Ok(Err(e))) => Err(ExecutionFailure::new(e.to_string())),
            Ok(Ok(Ok(json))) => Ok(json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::ExecutionObserver;
    use crate::model::FunctionKind;
    use parking_lot::Mutex;
    use serde_json::json;
    use uuid::Uuid;

    fn definition(name: &str, source: &str) -> FunctionDefinition {
        FunctionDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            label: name.to_string(),
            source: source.to_string(),
            kind: FunctionKind::BatchRecord,
        }
    }

    fn executor() -> Executor {
        Executor::new(&ExecutionConfig::default(), ExecutionHooks::default())
    }

    #[tokio::test]
    async fn test_invoke_transforms_record() {
        let def = definition(
            "total",
            "function total($record) { $record['total'] = $record['price'] * $record['qty']; return $record; }",
        );
        let result = executor()
            .invoke(&def, Some(json!({"price": 2.5, "qty": 4})))
            .await
            .unwrap();
        assert_eq!(result, json!({"price": 2.5, "qty": 4, "total": 10.0}));
    }

    #[tokio::test]
    async fn test_zero_arguments_without_record() {
        let def = definition("ping", "function ping($record = null) { return $record === null ? 'none' : 'some'; }");
        assert_eq!(executor().invoke(&def, None).await.unwrap(), json!("none"));
    }

    #[tokio::test]
    async fn test_preconditions() {
        let exec = executor();
        let err = exec.invoke(&definition("f", "  "), None).await.unwrap_err();
        assert_eq!(err.message, "Function f is empty");
        let err = exec.invoke(&definition("", "function f($record) { return 1; }"), None).await.unwrap_err();
        assert_eq!(err.message, "Function name is empty");
        let err = exec
            .invoke(&definition("f", "function f($record) { return 1; }"), Some(json!("text")))
            .await
            .unwrap_err();
        assert_eq!(err.message, "Function f expects an array as parameter");
    }

    #[tokio::test]
    async fn test_missing_entry_cannot_be_created() {
        let err = executor()
            .invoke(&definition("f", "function g($record) { return 1; }"), None)
            .await
            .unwrap_err();
        assert_eq!(err.message, "Function f could not be created");
    }

    #[tokio::test]
    async fn test_uncaught_exception_becomes_failure() {
        let def = definition("f", "function f($record) { throw new RuntimeException('bad row'); }");
        let err = executor().invoke(&def, Some(json!({}))).await.unwrap_err();
        assert_eq!(err.message, "Uncaught RuntimeException: bad row");
    }

    #[tokio::test]
    async fn test_runaway_loop_is_stopped() {
        let config = ExecutionConfig {
            timeout_ms: 200,
            gas: u64::MAX,
            ..ExecutionConfig::default()
        };
        let exec = Executor::new(&config, ExecutionHooks::default());
        let def = definition("spin", "function spin($record) { while (true) { $record = 1; } return $record; }");
        let err = exec.invoke(&def, None).await.unwrap_err();
        assert_eq!(err.message, "Function execution timeout");

        let config = ExecutionConfig {
            gas: 10_000,
            ..ExecutionConfig::default()
        };
        let exec = Executor::new(&config, ExecutionHooks::default());
        let err = exec.invoke(&def, None).await.unwrap_err();
        assert_eq!(err.message, "Gas limit of 10000 exhausted");
    }

    #[tokio::test]
    async fn test_materialization_is_cached_per_source() {
        let exec = executor();
        let v1 = definition("f", "function f($record) { return 1; }");
        let v2 = definition("f", "function f($record) { return 2; }");
        assert_eq!(exec.invoke(&v1, None).await.unwrap(), json!(1));
        assert_eq!(exec.invoke(&v1, None).await.unwrap(), json!(1));
        assert_eq!(exec.cached(), 1);
        assert_eq!(exec.invoke(&v2, None).await.unwrap(), json!(2));
        assert_eq!(exec.cached(), 2);
        exec.forget("f");
        assert_eq!(exec.cached(), 0);
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ExecutionObserver for Recorder {
        fn before_materialize(&self, name: &str, _source: &str) {
            self.events.lock().push(format!("materialize:{name}"));
        }
        fn before_invoke(&self, name: &str, _record: Option<&Json>) {
            self.events.lock().push(format!("invoke:{name}"));
        }
        fn after_invoke(&self, _name: &str, _record: Option<&Json>, result: &Json) {
            self.events.lock().push(format!("result:{result}"));
        }
        fn on_failure(&self, _name: &str, _record: Option<&Json>, failure: &ExecutionFailure) {
            self.events.lock().push(format!("failure:{}", failure.message));
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let recorder = Arc::new(Recorder::default());
        let hooks = ExecutionHooks::new()
            .with_gate(|name, _| name != "blocked")
            .with_param_transform(|_, record| {
                record.map(|mut r| {
                    r["seen"] = json!(true);
                    r
                })
            })
            .with_result_transform(|_, _, result| json!({"wrapped": result}))
            .with_observer(recorder.clone());
        let exec = Executor::new(&ExecutionConfig::default(), hooks);

        let def = definition("f", "function f($record) { return $record['seen']; }");
        assert_eq!(exec.invoke(&def, Some(json!({}))).await.unwrap(), json!({"wrapped": true}));
        assert_eq!(exec.invoke(&def, Some(json!({}))).await.unwrap(), json!({"wrapped": true}));

        let blocked = definition("blocked", "function blocked($record) { return 1; }");
        let err = exec.invoke(&blocked, None).await.unwrap_err();
        assert_eq!(err.message, "Function execution prevented by hook");

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "invoke:f",
                "materialize:f",
                r#"result:{"wrapped":true}"#,
                "invoke:f",
                r#"result:{"wrapped":true}"#,
                "failure:Function execution prevented by hook",
            ]
        );
    }
}
