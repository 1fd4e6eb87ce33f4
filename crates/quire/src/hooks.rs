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

//! Extension points. Each point is an ordered list; transforms run in
//! registration order and each sees the previous one's output.

use crate::error::ExecutionFailure;
use crate::executor::Executor;
use crate::model::{DispatchResponse, ExecutionRequest, FunctionDefinition};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub type ExecutionGate = Arc<dyn Fn(&str, Option<&Value>) -> bool + Send + Sync>;
pub type ParamTransform = Arc<dyn Fn(&str, Option<Value>) -> Option<Value> + Send + Sync>;
pub type ResultTransform = Arc<dyn Fn(&str, Option<&Value>, Value) -> Value + Send + Sync>;

/// Notified around materialization and invocation. Every method has an
/// empty default so observers only implement what they watch.
pub trait ExecutionObserver: Send + Sync {
    fn before_materialize(&self, _name: &str, _source: &str) {}
    fn after_materialize(&self, _name: &str) {}
    fn before_invoke(&self, _name: &str, _record: Option<&Value>) {}
    fn after_invoke(&self, _name: &str, _record: Option<&Value>, _result: &Value) {}
    fn on_failure(&self, _name: &str, _record: Option<&Value>, _failure: &ExecutionFailure) {}
}

#[derive(Clone, Default)]
pub struct ExecutionHooks {
    pub(crate) gates: Vec<ExecutionGate>,
    pub(crate) params: Vec<ParamTransform>,
    pub(crate) results: Vec<ResultTransform>,
    pub(crate) observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ExecutionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gate(mut self, gate: impl Fn(&str, Option<&Value>) -> bool + Send + Sync + 'static) -> Self {
        self.gates.push(Arc::new(gate));
        self
    }

    pub fn with_param_transform(
        mut self,
        transform: impl Fn(&str, Option<Value>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.params.push(Arc::new(transform));
        self
    }

    pub fn with_result_transform(
        mut self,
        transform: impl Fn(&str, Option<&Value>, Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.results.push(Arc::new(transform));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub(crate) fn should_execute(&self, name: &str, record: Option<&Value>) -> bool {
        self.gates.iter().all(|gate| gate(name, record))
    }

    pub(crate) fn transform_params(&self, name: &str, record: Option<Value>) -> Option<Value> {
        self.params.iter().fold(record, |record, transform| transform(name, record))
    }

    pub(crate) fn transform_result(&self, name: &str, record: Option<&Value>, result: Value) -> Value {
        self.results
            .iter()
            .fold(result, |result, transform| transform(name, record, result))
    }

    pub(crate) fn notify(&self, event: impl Fn(&dyn ExecutionObserver)) {
        for observer in &self.observers {
            event(observer.as_ref());
        }
    }
}

impl fmt::Debug for ExecutionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHooks")
            .field("gates", &self.gates.len())
            .field("params", &self.params.len())
            .field("results", &self.results.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

pub type DispatchParamsTransform = Arc<dyn Fn(&ExecutionRequest, Option<Value>) -> Option<Value> + Send + Sync>;
pub type DispatchMetaTransform = Arc<dyn Fn(&ExecutionRequest, Option<Value>) -> Option<Value> + Send + Sync>;
pub type DispatchResponseTransform = Arc<dyn Fn(&ExecutionRequest, DispatchResponse) -> DispatchResponse + Send + Sync>;

#[derive(Clone, Default)]
pub struct DispatchHooks {
    pub(crate) params: Vec<DispatchParamsTransform>,
    pub(crate) meta: Vec<DispatchMetaTransform>,
    pub(crate) response: Vec<DispatchResponseTransform>,
}

impl DispatchHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params_transform(
        mut self,
        transform: impl Fn(&ExecutionRequest, Option<Value>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.params.push(Arc::new(transform));
        self
    }

    pub fn with_meta_transform(
        mut self,
        transform: impl Fn(&ExecutionRequest, Option<Value>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.meta.push(Arc::new(transform));
        self
    }

    pub fn with_response_transform(
        mut self,
        transform: impl Fn(&ExecutionRequest, DispatchResponse) -> DispatchResponse + Send + Sync + 'static,
    ) -> Self {
        self.response.push(Arc::new(transform));
        self
    }

    pub(crate) fn transform_params(&self, request: &ExecutionRequest, params: Option<Value>) -> Option<Value> {
        self.params.iter().fold(params, |params, transform| transform(request, params))
    }

    pub(crate) fn transform_meta(&self, request: &ExecutionRequest, meta: Option<Value>) -> Option<Value> {
        self.meta.iter().fold(meta, |meta, transform| transform(request, meta))
    }

    pub(crate) fn transform_response(&self, request: &ExecutionRequest, response: DispatchResponse) -> DispatchResponse {
        self.response
            .iter()
            .fold(response, |response, transform| transform(request, response))
    }
}

impl fmt::Debug for DispatchHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHooks")
            .field("params", &self.params.len())
            .field("meta", &self.meta.len())
            .field("response", &self.response.len())
            .finish()
    }
}

/// Handles a function kind beyond the three built in ones.
#[async_trait]
pub trait CustomKindHandler: Send + Sync {
    /// Whether requests of this wire `type` are accepted at all.
    fn claims(&self, kind: &str) -> bool;

    /// `None` passes the request to the next handler.
    async fn handle(
        &self,
        request: &ExecutionRequest,
        function: &FunctionDefinition,
        executor: &Executor,
    ) -> Option<DispatchResponse>;
}
