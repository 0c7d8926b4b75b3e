//! Liveness, readiness and metrics endpoints.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::state::AppState;

/// Liveness probe: up as long as the process serves requests.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "agent-switchboard" }))
}

/// Readiness probe: 200 once the embedder and stores are initialised.
pub async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready")
    }
}

/// Prometheus metrics in OpenMetrics text format.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .recorder_buffer_depth
        .set(state.recorder.buffered().await as i64);

    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}
