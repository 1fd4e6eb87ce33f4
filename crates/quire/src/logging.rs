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

use crate::model::{DispatchResponse, ValidationResult};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub fn log_validation(function: &str, result: &ValidationResult) {
    if result.valid {
        debug!(
            function = function,
            layer = ?result.checked_by,
            "Function code accepted"
        );
    } else {
        info!(
            function = function,
            reason = %result.message,
            "Function code rejected"
        );
    }
}

pub fn log_registry_event(event: &str, function: &str) {
    info!(event = event, function = function, "Registry event");
}

pub fn log_execution(function: &str, elapsed: Duration, gas_used: u64) {
    debug!(
        function = function,
        elapsed_ms = elapsed.as_millis() as u64,
        gas_used = gas_used,
        "Function executed"
    );
}

pub fn log_execution_failure(function: &str, message: &str) {
    warn!(function = function, error = message, "Function execution failed");
}

pub fn log_dispatch(task_id: &str, method: &str, kind: &str, response: &DispatchResponse) {
    info!(
        task_id = task_id,
        method = method,
        kind = kind,
        success = response.success,
        message = response.message.as_deref().unwrap_or(""),
        "Process request handled"
    );
}

pub fn log_audit_failure(task_id: &str, error: &dyn std::error::Error) {
    error!(task_id = task_id, error = %error, "Failed to append audit entry");
}

pub fn log_hook_event(hook: &str, payload: &Value) {
    debug!(
        hook = hook,
        payload = %serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()),
        "Hook event"
    );
}
