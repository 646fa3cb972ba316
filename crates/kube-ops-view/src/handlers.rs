//! HTTP request handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::state::ViewState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `shutting_down` while draining.
    pub status: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Number of clusters served.
    pub clusters: usize,
    /// Number of connected dashboard clients.
    pub subscribers: usize,
}

/// Handle GET /health. Fails with 503 once shutdown has begun.
pub async fn health_check(State(state): State<Arc<ViewState>>) -> Response {
    let shutting_down = state.is_shutting_down();
    let body = HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.to_string(),
        uptime_secs: state.uptime_secs(),
        clusters: state.registry().len(),
        subscribers: state.hub().subscriber_count(),
    };

    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

/// Handle GET /clusters - IDs of every served cluster.
pub async fn list_clusters(State(state): State<Arc<ViewState>>) -> Json<Vec<String>> {
    Json(
        state
            .registry()
            .ids()
            .map(|id| id.as_str().to_string())
            .collect(),
    )
}
