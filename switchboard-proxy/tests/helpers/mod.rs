//! Shared test harness: an in-memory switchboard wired to a real mock
//! upstream listening on an ephemeral port.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use switchboard_core::embedding::HashEmbedder;
use switchboard_core::store::{MemoryKv, MemoryStore};
use switchboard_core::SwitchboardConfig;
use switchboard_proxy::build_router;
use switchboard_proxy::state::AppState;

pub const DEMO_TOKEN: &str = "demo_token_abc123";
pub const DEMO_ORG: &str = "org_demo";

/// A mock model provider that counts hits and records forwarded headers.
#[derive(Clone)]
pub struct MockUpstream {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    pub last_headers: Arc<Mutex<Option<HeaderMap>>>,
}

#[derive(Clone)]
struct MockState {
    hits: Arc<AtomicUsize>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
}

async fn mock_handler(State(state): State<MockState>, request: Request<Body>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_headers.lock().await = Some(request.headers().clone());
    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "4"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 1}
    }))
}

impl MockUpstream {
    /// Bind on an ephemeral port and serve until the test process exits.
    pub async fn spawn() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let last_headers = Arc::new(Mutex::new(None));
        let state = MockState {
            hits: hits.clone(),
            last_headers: last_headers.clone(),
        };
        let app = Router::new().fallback(mock_handler).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            hits,
            last_headers,
        }
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// A fully wired switchboard over in-memory backends.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub upstream: MockUpstream,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a config tweak, e.g. shadow mode.
    pub async fn spawn_with(tweak: impl FnOnce(&mut SwitchboardConfig)) -> Self {
        let upstream = MockUpstream::spawn().await;
        let mut config = SwitchboardConfig::default();
        config.upstream_openai = upstream.base_url.clone();
        config.upstream_anthropic = upstream.base_url.clone();
        config.upstream_google = upstream.base_url.clone();
        tweak(&mut config);

        let state = AppState::build(
            config,
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryStore::with_demo_org(DEMO_TOKEN).await),
            Arc::new(HashEmbedder::new()),
        )
        .await
        .unwrap();
        state.mark_ready();
        Self {
            router: build_router(state.clone()),
            state,
            upstream,
        }
    }

    /// One proxied chat completion with the demo token.
    pub fn chat_request(&self, agent_id: &str, content: &str) -> Request<Body> {
        let body = json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": content}]
        });
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("x-switchboard-token", DEMO_TOKEN)
            .header("x-agent-id", agent_id)
            .header("authorization", "Bearer sk-mock-key")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        use tower::ServiceExt;
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, headers, value)
    }

    /// Convenience for control-API calls.
    pub fn api_request(&self, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }
}
