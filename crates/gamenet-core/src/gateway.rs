// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP gateway for session-aware methods.
//!
//! `POST /{service}/{method}` runs the method with the session taken from the
//! `token` header (decimal user id). The request body is the payload and the
//! reply payload is the response body. `GET /services` lists what is
//! registered.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gamenet_protocol::Session;
use serde_json::json;
use tracing::debug;

use crate::error::RpcError;
use crate::registry::{Registry, ServiceInfo};

/// Header carrying the caller's user id.
pub const TOKEN_HEADER: &str = "token";

/// Build the gateway router over `registry`.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/services", get(list_services))
        .route("/{service}/{method}", post(handle_call))
        .with_state(registry)
}

fn session_from_headers(headers: &HeaderMap) -> Result<Session, RpcError> {
    let token = headers
        .get(TOKEN_HEADER)
        .ok_or_else(|| RpcError::InvalidMetadata("missing 'token' header".to_string()))?;
    token
        .to_str()
        .ok()
        .and_then(|t| t.trim().parse::<u64>().ok())
        .map(Session::new)
        .ok_or_else(|| RpcError::InvalidMetadata("malformed 'token' header".to_string()))
}

fn status_for(err: &RpcError) -> StatusCode {
    match err {
        RpcError::NotFound(_) => StatusCode::NOT_FOUND,
        RpcError::InvalidMetadata(_) => StatusCode::UNAUTHORIZED,
        RpcError::DecodeFailure(_) => StatusCode::BAD_REQUEST,
        RpcError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RpcError::TransportFailure(_) | RpcError::StreamClosed => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = json!({ "code": self.error_code(), "error": self.detail() });
        (status_for(&self), Json(body)).into_response()
    }
}

async fn handle_call(
    State(registry): State<Arc<Registry>>,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session = match session_from_headers(&headers) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let service_method = format!("{service}.{method}");
    debug!(method = %service_method, user_id = session.user_id, "gateway call");

    match registry
        .dispatch_stream(&service_method, body.to_vec(), session)
        .await
    {
        Ok(payload) => (StatusCode::OK, payload).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_services(State(registry): State<Arc<Registry>>) -> Json<Vec<ServiceInfo>> {
    Json(registry.services())
}
