//! The proxy orchestrator: the `/v1/*` pipeline.
//!
//! Order of operations per request: emergency stop, token → organisation,
//! agent admission, pre-hook workers, firewall, resource lock, cache,
//! upstream forward, post-hook workers, trace record, lock release,
//! response decoration. Denial traces are persisted before the 403 is
//! written; locks acquired here are released on every exit path.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use switchboard_core::body::{
    estimate_input_tokens, extract_model, extract_prompt_key, serialize_body,
};
use switchboard_core::events::EventType;
use switchboard_core::firewall::{Decision, FirewallRequest};
use switchboard_core::recorder::{derive_cost, TraceContext, TraceData};
use switchboard_core::sandbox::WorkerTrigger;
use switchboard_core::traffic::{extract_resource, is_write_operation, Resolution, ResourceRef};
use switchboard_core::types::{ActionTaken, AgentStatus};
use switchboard_core::SwitchboardError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Maximum request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
/// Upper bound on the queued-lock wait.
const MAX_QUEUE_WAIT: Duration = Duration::from_millis(5000);
/// TTL for the token → org shortcut in the KV store.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(300);

const TRACE_ID_HEADER: &str = "x-switchboard-trace-id";
const LATENCY_HEADER: &str = "x-switchboard-latency-ms";
const RISK_HEADER: &str = "x-switchboard-risk-score";
const CACHE_HEADER: &str = "x-switchboard-cache";

/// Headers never forwarded upstream, beyond the `x-switchboard-` prefix.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

fn is_forwardable(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    !lowered.starts_with("x-switchboard-") && !HOP_BY_HOP.contains(&lowered.as_str())
}

/// Everything resolved at ingress, threaded through the pipeline stages.
struct RequestContext {
    org_id: String,
    agent_id: String,
    agent_name: Option<String>,
    agent_framework: Option<String>,
    method: Method,
    path_query: String,
    headers: HeaderMap,
    client_ip: Option<String>,
    user_agent: Option<String>,
    trace: TraceContext,
}

impl RequestContext {
    fn request_type(&self) -> &'static str {
        if self.path_query.contains("chat/completions") {
            "chat_completion"
        } else if self.path_query.contains("completions") {
            "completion"
        } else if self.path_query.contains("embeddings") {
            "embedding"
        } else if self.path_query.contains("messages") {
            "messages"
        } else {
            "proxy"
        }
    }

    fn worker_env(&self) -> HashMap<String, String> {
        HashMap::from([
            ("org_id".to_string(), self.org_id.clone()),
            ("agent_id".to_string(), self.agent_id.clone()),
        ])
    }
}

/// The `/v1/*` handler.
pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let response = match handle(state.clone(), request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    state.metrics.record_request(response.status().as_u16());
    response
}

async fn handle(state: AppState, request: Request) -> ApiResult<Response> {
    // Emergency stop short-circuits before any other work.
    if state.traffic.is_stopped() {
        return Err(SwitchboardError::EmergencyStop.into());
    }

    let (parts, raw_body) = request.into_parts();
    let headers = parts.headers;

    let token = header_str(&headers, "x-switchboard-token")
        .ok_or(ApiError(SwitchboardError::MissingToken))?;
    let org_id = resolve_org(&state, &token).await?;

    let agent_id =
        header_str(&headers, "x-agent-id").unwrap_or_else(|| "anonymous".to_string());
    let agent_name = header_str(&headers, "x-agent-name");
    let agent_framework = header_str(&headers, "x-agent-framework");

    // A paused or revoked agent never reaches an upstream.
    ensure_agent_admitted(&state, &agent_id).await?;

    let body_bytes = to_bytes(raw_body, MAX_BODY_BYTES)
        .await
        .map_err(|e| SwitchboardError::Evaluation(format!("body read: {e}")))?;
    let mut body: Value = parse_body(&body_bytes);

    let ctx = RequestContext {
        org_id,
        agent_id,
        agent_name,
        agent_framework,
        method: parts.method,
        path_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        client_ip: header_str(&headers, "x-forwarded-for"),
        user_agent: header_str(&headers, "user-agent"),
        headers,
        trace: state.recorder.create_context(None),
    };

    // Pre-hook worker chain. A worker-provided response short-circuits.
    let pre = state
        .sandbox
        .run_chain(WorkerTrigger::PreRequest, &body, None, &ctx.worker_env())
        .await;
    if let Some(ref new_request) = pre.request {
        body = new_request.clone();
    }
    if let Some(worker_response) = pre.response {
        debug!(agent = %ctx.agent_id, "Pre-request worker short-circuited the pipeline");
        return short_circuit_response(&state, &ctx, body, worker_response).await;
    }

    // Firewall.
    let decision = state.firewall.evaluate(&FirewallRequest {
        body: &body,
        method: ctx.method.as_str(),
        path: &ctx.path_query,
    });
    state
        .metrics
        .record_decision(decision.action.as_str(), decision.latency_ms);
    // Soft budget: measured and reported, never enforced.
    if decision.latency_ms > state.config.firewall_max_latency_ms as f64 {
        warn!(
            latency_ms = decision.latency_ms,
            budget_ms = state.config.firewall_max_latency_ms,
            "Firewall evaluation exceeded its latency budget"
        );
    }

    if !decision.allowed {
        return deny_response(&state, &ctx, body, decision).await;
    }
    if let Some(ref rewritten) = decision.rewritten_body {
        body = rewritten.clone();
    }

    // Resource lock.
    let body_text = serialize_body(&body);
    let mut held_lock: Option<ResourceRef> = None;
    if let Some(resource) = extract_resource(&body_text) {
        let is_write = is_write_operation(&body_text, ctx.method.as_str());
        let outcome = state
            .traffic
            .request_access(&ctx.agent_id, resource.resource_type, &resource.path, is_write)
            .await?;
        state.metrics.record_lock(match outcome.resolution {
            Resolution::Granted => "granted",
            Resolution::Queued => "queued",
            Resolution::Rejected => "rejected",
        });
        match outcome.resolution {
            Resolution::Rejected => {
                return Err(SwitchboardError::ResourceLocked {
                    resource: resource.qualified(),
                }
                .into());
            }
            Resolution::Queued => {
                let wait = Duration::from_millis(outcome.wait_ms.unwrap_or(0));
                tokio::time::sleep(wait.min(MAX_QUEUE_WAIT)).await;
                state
                    .traffic
                    .leave_queue(resource.resource_type, &resource.path);
            }
            Resolution::Granted => {
                if outcome.lock.is_some() {
                    held_lock = Some(resource);
                }
            }
        }
    }

    let result = serve_request(&state, &ctx, body, decision).await;

    // Scoped release: the lock goes away on success and failure alike.
    if let Some(resource) = held_lock {
        if let Err(e) = state
            .traffic
            .release_access(&ctx.agent_id, resource.resource_type, &resource.path)
            .await
        {
            warn!(error = %e, "Lock release failed; TTL expiry will reclaim it");
        }
    }
    result
}

/// Cache lookup, upstream forward, post-hooks, trace record, decoration.
async fn serve_request(
    state: &AppState,
    ctx: &RequestContext,
    body: Value,
    decision: Decision,
) -> ApiResult<Response> {
    let model = extract_model(&body).map(str::to_string);
    let prompt_key = extract_prompt_key(&body);

    // Cache lookup participates only when both scope parts exist.
    let mut cache_hit = None;
    if let (Some(model), Some(key)) = (model.as_deref(), prompt_key.as_deref()) {
        cache_hit = state.cache.lookup(&ctx.org_id, model, key).await;
        state
            .metrics
            .record_cache(match cache_hit.as_ref().map(|h| h.similarity >= 1.0) {
                Some(true) => "hit_exact",
                Some(false) => "hit_ann",
                None => "miss",
            });
    }

    let (status, mut response_value, from_cache) = match cache_hit {
        Some(hit) => {
            let response_value = parse_body(&Bytes::from(hit.response_text.clone()));
            // Hit accounting is best-effort and priced as the skipped call.
            if let Some(ref model) = model {
                let saved = derive_cost(
                    model,
                    estimate_input_tokens(&body),
                    (hit.response_text.len() / 4) as i64,
                );
                state.cache.record_hit(hit.cache_id, saved).await;
            }
            (StatusCode::OK, response_value, true)
        }
        None => {
            let (status, bytes) = forward_upstream(state, ctx, &body).await?;
            let response_value = parse_body(&bytes);
            if status.is_success() {
                if let (Some(model), Some(key)) = (model.as_deref(), prompt_key.as_deref()) {
                    let (_, output_tokens) =
                        switchboard_core::body::extract_usage(&response_value);
                    state
                        .cache
                        .store(
                            &ctx.org_id,
                            model,
                            key,
                            &String::from_utf8_lossy(&bytes),
                            output_tokens,
                        )
                        .await;
                }
            }
            (status, response_value, false)
        }
    };

    // Post-hook worker chain may rewrite the response.
    let post = state
        .sandbox
        .run_chain(
            WorkerTrigger::PostResponse,
            &body,
            Some(&response_value),
            &ctx.worker_env(),
        )
        .await;
    if let Some(rewritten) = post.response {
        response_value = rewritten;
    }

    // Cache-served traces carry their own request type so the hourly
    // cache aggregates can count them.
    let request_type = if from_cache {
        "cache_hit"
    } else {
        ctx.request_type()
    };
    let trace =
        record_trace(state, ctx, &decision, request_type, body, response_value.clone()).await;

    let mut response = build_json_response(status, &response_value);
    decorate(
        &mut response,
        &ctx.trace,
        decision.risk_score,
        if from_cache { "HIT" } else { "MISS" },
    );
    if let Some(trace) = trace {
        state.emit_event(
            EventType::TraceEvent,
            Some(&ctx.org_id),
            serde_json::json!({
                "trace_id": trace.trace_id,
                "agent_id": trace.agent_id,
                "action": trace.action_taken,
                "risk_score": trace.risk_score,
                "duration_ms": trace.duration_ms,
            }),
        );
    }
    Ok(response)
}

/// Firewall denial: synchronous trace, fan-out event, decorated 403.
async fn deny_response(
    state: &AppState,
    ctx: &RequestContext,
    body: Value,
    decision: Decision,
) -> ApiResult<Response> {
    let reason = decision
        .reason
        .clone()
        .unwrap_or_else(|| "blocked".to_string());
    record_trace(state, ctx, &decision, ctx.request_type(), body, Value::Null).await;
    state.emit_event(
        EventType::AgentBlocked,
        Some(&ctx.org_id),
        serde_json::json!({
            "agent_id": ctx.agent_id,
            "reason": reason,
            "risk_score": decision.risk_score,
            "trace_id": ctx.trace.trace_id,
        }),
    );

    let error = SwitchboardError::PolicyViolation { reason };
    let mut response =
        (StatusCode::FORBIDDEN, Json(error.to_body())).into_response();
    decorate(&mut response, &ctx.trace, decision.risk_score, "MISS");
    Ok(response)
}

/// A pre-request worker supplied the response; record and return it.
async fn short_circuit_response(
    state: &AppState,
    ctx: &RequestContext,
    body: Value,
    worker_response: Value,
) -> ApiResult<Response> {
    let decision = Decision {
        allowed: true,
        action: ActionTaken::Modified,
        reason: Some("worker-provided response".to_string()),
        risk_score: 0.0,
        intent_category: None,
        latency_ms: 0.0,
        is_shadow_event: false,
        policy_id: state.policy.snapshot().policy_id.clone(),
        rewritten_body: None,
    };
    record_trace(state, ctx, &decision, ctx.request_type(), body, worker_response.clone()).await;
    let mut response = build_json_response(StatusCode::OK, &worker_response);
    decorate(&mut response, &ctx.trace, 0.0, "MISS");
    Ok(response)
}

async fn record_trace(
    state: &AppState,
    ctx: &RequestContext,
    decision: &Decision,
    request_type: &str,
    request_body: Value,
    response_body: Value,
) -> Option<switchboard_core::types::TraceRecord> {
    let provider = select_upstream(state, &ctx.headers).0;
    let data = TraceData {
        org_id: ctx.org_id.clone(),
        agent_id: ctx.agent_id.clone(),
        agent_name: ctx.agent_name.clone(),
        agent_framework: ctx.agent_framework.clone(),
        request_type: request_type.to_string(),
        model_provider: Some(provider.to_string()),
        model_name: extract_model(&request_body).map(str::to_string),
        request_body,
        response_body,
        client_ip: ctx.client_ip.clone(),
        user_agent: ctx.user_agent.clone(),
        custom_metadata: serde_json::json!({}),
    };
    match state.recorder.record(&ctx.trace, decision, data).await {
        Ok(trace) => Some(trace),
        Err(e) => {
            warn!(error = %e, "Trace record failed");
            None
        }
    }
}

/// Pick the upstream by the caller's Authorization token prefix.
fn select_upstream<'a>(state: &'a AppState, headers: &HeaderMap) -> (&'static str, &'a str) {
    let credential = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .unwrap_or("");
    if credential.starts_with("sk-ant-") {
        ("anthropic", state.config.upstream_anthropic.as_str())
    } else if credential.starts_with("AIza") {
        ("google", state.config.upstream_google.as_str())
    } else {
        ("openai", state.config.upstream_openai.as_str())
    }
}

/// Forward to the selected upstream. No retries; failures surface as 502.
async fn forward_upstream(
    state: &AppState,
    ctx: &RequestContext,
    body: &Value,
) -> ApiResult<(StatusCode, Bytes)> {
    let (provider, base) = select_upstream(state, &ctx.headers);
    let url = format!("{}{}", base.trim_end_matches('/'), ctx.path_query);
    debug!(provider, url = %url, "Forwarding upstream");

    let method = reqwest::Method::from_bytes(ctx.method.as_str().as_bytes())
        .map_err(|e| SwitchboardError::Upstream {
            message: format!("invalid method: {e}"),
        })?;
    let mut builder = state.http.request(method, &url);
    for (name, value) in ctx.headers.iter() {
        if is_forwardable(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    if !ctx.headers.contains_key("content-type") {
        builder = builder.header("content-type", "application/json");
    }
    // Non-JSON bodies were carried as text; forward them verbatim.
    let payload = match body {
        Value::String(text) => text.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    };
    let response = builder
        .body(payload)
        .send()
        .await
        .map_err(|e| SwitchboardError::Upstream {
            message: classify_upstream_error(&e),
        })?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    state.metrics.upstream_requests_total
        .get_or_create(&switchboard_core::metrics::RequestLabels {
            status: std::borrow::Cow::Owned(status.as_u16().to_string()),
        })
        .inc();
    let bytes = response.bytes().await.map_err(|e| SwitchboardError::Upstream {
        message: classify_upstream_error(&e),
    })?;
    Ok((status, bytes))
}

fn classify_upstream_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "upstream timeout".to_string()
    } else if error.is_connect() {
        "upstream connection failed".to_string()
    } else {
        "upstream request failed".to_string()
    }
}

async fn resolve_org(state: &AppState, token: &str) -> ApiResult<String> {
    let key = format!("org:token:{token}");
    match state.kv.get(&key).await {
        Ok(Some(org_id)) => return Ok(org_id),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Token shortcut lookup failed, falling back to store"),
    }
    let org = state
        .store
        .org_by_token(token)
        .await?
        .ok_or(ApiError(SwitchboardError::InvalidToken))?;
    if let Err(e) = state.kv.set_ttl(&key, &org.org_id, TOKEN_CACHE_TTL).await {
        warn!(error = %e, "Token shortcut write failed");
    }
    Ok(org.org_id)
}

async fn ensure_agent_admitted(state: &AppState, agent_id: &str) -> ApiResult<()> {
    if state.controls.is_globally_paused() || state.controls.is_agent_paused(agent_id) {
        return Err(SwitchboardError::AgentSuspended {
            agent_id: agent_id.to_string(),
            status: "paused".to_string(),
        }
        .into());
    }
    if let Some(agent) = state.store.get_agent(agent_id).await? {
        match agent.status {
            AgentStatus::Paused | AgentStatus::Revoked => {
                return Err(SwitchboardError::AgentSuspended {
                    agent_id: agent_id.to_string(),
                    status: agent.status.as_str().to_string(),
                }
                .into());
            }
            AgentStatus::Active | AgentStatus::Warning => {}
        }
    }
    Ok(())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Bodies are opaque: valid JSON parses, anything else is carried as text.
fn parse_body(bytes: &Bytes) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn build_json_response(status: StatusCode, value: &Value) -> Response {
    let payload = match value {
        Value::String(text) => Body::from(text.clone()),
        other => Body::from(other.to_string()),
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(payload)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn decorate(response: &mut Response, trace: &TraceContext, risk_score: f64, cache: &str) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&trace.trace_id.to_string()) {
        headers.insert(TRACE_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", trace.elapsed_ms())) {
        headers.insert(LATENCY_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{risk_score:.0}")) {
        headers.insert(RISK_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(cache) {
        headers.insert(CACHE_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_hygiene() {
        assert!(!is_forwardable("Host"));
        assert!(!is_forwardable("connection"));
        assert!(!is_forwardable("Content-Length"));
        assert!(!is_forwardable("X-Switchboard-Token"));
        assert!(!is_forwardable("x-switchboard-trace-id"));
        assert!(!is_forwardable("Proxy-Authorization"));
        assert!(is_forwardable("authorization"));
        assert!(is_forwardable("content-type"));
        assert!(is_forwardable("x-agent-id"));
    }

    #[test]
    fn test_parse_body_falls_back_to_text() {
        assert_eq!(
            parse_body(&Bytes::from_static(b"{\"a\":1}")),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            parse_body(&Bytes::from_static(b"plain text")),
            Value::String("plain text".to_string())
        );
        assert_eq!(parse_body(&Bytes::new()), Value::Null);
    }
}
