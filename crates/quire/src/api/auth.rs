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

//! Request gates. Admin routes take the admin bearer token. Client routes
//! take a configured or issued API key, and execution routes additionally
//! answer only while execution is enabled.

use crate::Engine;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .or_else(|| bearer(headers))
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn require_admin(State(engine): State<Arc<Engine>>, request: Request<Body>, next: Next) -> Response {
    let authorised = match (&engine.config().auth.admin_token, bearer(request.headers())) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    };
    if !authorised {
        debug!(path = %request.uri().path(), "Admin request rejected");
        return reject(StatusCode::UNAUTHORIZED, "Not authorized");
    }
    next.run(request).await
}

fn known_key(engine: &Engine, headers: &HeaderMap) -> bool {
    api_key(headers).is_some_and(|key| engine.keys().accepts(key))
}

/// Key check only, so clients can still read whether execution is enabled.
pub async fn require_client_key(State(engine): State<Arc<Engine>>, request: Request<Body>, next: Next) -> Response {
    if !known_key(&engine, request.headers()) {
        debug!(path = %request.uri().path(), "Client request rejected");
        return reject(StatusCode::UNAUTHORIZED, "Not authorized");
    }
    next.run(request).await
}

pub async fn require_api_key(State(engine): State<Arc<Engine>>, request: Request<Body>, next: Next) -> Response {
    if !engine.enabled() {
        return reject(StatusCode::FORBIDDEN, "Functionality is disabled from the plugin settings.");
    }
    if !known_key(&engine, request.headers()) {
        debug!(path = %request.uri().path(), "Execution request rejected");
        return reject(StatusCode::UNAUTHORIZED, "Not authorized");
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_key_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(api_key(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  k2 "));
        assert_eq!(api_key(&headers), Some("k2"));
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("k1"));
        assert_eq!(api_key(&headers), Some("k1"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);
    }
}
