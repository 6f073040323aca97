use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::TextEncoder;
use serde_json::json;
use tracing::error;

use crate::poller::Poller;

const INTERNAL_SERVER_ERROR: &str = "Internal server error";

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, message: String) -> HttpError {
        Self { status, message }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = if self.status.is_server_error() {
            error!("Internal server error: {}", self.message);
            Json(json!({"error": INTERNAL_SERVER_ERROR}))
        } else {
            Json(json!({"error": self.message}))
        };

        (self.status, body).into_response()
    }
}

async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn metrics() -> Result<Response, HttpError> {
    let metric_families = prometheus::gather();
    let mut buffer = String::with_capacity(1024);
    let encoder = TextEncoder::new();
    encoder
        .encode_utf8(&metric_families, &mut buffer)
        .map_err(|e| {
            HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
        })?;
    Ok(buffer.into_response())
}

/// The report of the most recently finished cycle.
async fn last_cycle(State(poller): State<Arc<Poller>>) -> Result<Response, HttpError> {
    let report = poller.last_report().ok_or_else(|| {
        HttpError::new(
            StatusCode::NOT_FOUND,
            "no cycle has finished yet".to_string(),
        )
    })?;
    Ok(Json(report).into_response())
}

pub fn create_axum_app(poller: Arc<Poller>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/last_cycle", get(last_cycle))
        .with_state(poller)
}
