//! switchboard-proxy — the HTTP surface of AgentSwitchboard.
//!
//! Routes:
//! - `/v1/*` — the proxy pipeline (any method), see [`orchestrator`]
//! - `/api/...` — the control API, see [`api`]
//! - `/ws` — the event channel, see [`ws`]
//! - `/health`, `/ready`, `/metrics` — operational endpoints

pub mod admin;
pub mod api;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod ws;

use axum::routing::{any, get};
use axum::Router;

use state::AppState;

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/*path", any(orchestrator::proxy_handler))
        .nest("/api", api::router())
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(admin::health_handler))
        .route("/ready", get(admin::readiness_handler))
        .route("/metrics", get(admin::metrics_handler))
        .with_state(state)
}
