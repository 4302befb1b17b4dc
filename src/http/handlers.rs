//! Axum HTTP handlers for the web server
//!
//! Provides the JSON-RPC endpoint and the general metadata endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::errors::RpcError;
use crate::rpc::RpcResponse;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub server: String,
    pub mid: String,
    pub concurrency: &'static str,
    pub rpc_endpoint: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        server: state.server.name.clone(),
        mid: state.server.mid.to_string(),
        concurrency: state.server.mode.as_str(),
        rpc_endpoint: state.dispatcher.path().to_string(),
    })
}

pub async fn rpc_endpoint(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "request body is not valid JSON");
            let response = RpcResponse::failure(Value::Null, &RpcError::internal("Parse error"));
            return rpc_response(&state, response.into_value());
        }
    };

    // Callables are synchronous and may block.
    let dispatcher = Arc::clone(&state.dispatcher);
    let server = Arc::clone(&state.server);
    let response =
        match tokio::task::spawn_blocking(move || dispatcher.handle_payload(&server, payload)).await
        {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "dispatch task failed");
                RpcResponse::failure(
                    Value::Null,
                    &RpcError::internal(format!("Unhandled server exception: {err}")),
                )
                .into_value()
            }
        };

    rpc_response(&state, response)
}

fn rpc_response(state: &AppState, body: Value) -> Response {
    let mut response = (StatusCode::OK, Json(body)).into_response();
    match HeaderValue::from_str(state.dispatcher.content_type()) {
        Ok(content_type) => {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        Err(_) => warn!(
            content_type = state.dispatcher.content_type(),
            "ignoring invalid content type"
        ),
    }
    response
}
