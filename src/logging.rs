use std::time::Instant;

use axum::{
    extract::Request,
    http::header::CONTENT_LENGTH,
    middleware::Next,
    response::Response,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const HEALTH_PATH: &str = "/health";

/// Logs go to stderr: a process worker's stdout carries its control channel.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let body_bytes = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = started_at.elapsed().as_millis() as u64;

    // Health probes are frequent and uninteresting.
    if path == HEALTH_PATH {
        debug!(method = %method, status, duration_ms, "health probe");
        return response;
    }

    if response.status().is_client_error() {
        warn!(method = %method, path = %path, status, body_bytes, "request rejected");
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            body_bytes,
            duration_ms,
            "request summary"
        );
    }

    response
}
