//! The control API under `/api`: dashboards read burn rate, traces,
//! agents, cache stats, policies and WAF rules here, and every mutation
//! (pause, revoke, emergency stop, policy update, rule toggle) applies to
//! state and/or store and then emits a fan-out event.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use switchboard_core::events::EventType;
use switchboard_core::policy::PolicyUpdate;
use switchboard_core::types::AgentStatus;
use switchboard_core::SwitchboardError;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/burn-rate/:org", get(burn_rate))
        .route("/agents/:org", get(agents))
        .route("/traces/:org", get(traces))
        .route("/traces/:org/blocked", get(blocked_traces))
        .route("/traces/:org/shadow", get(shadow_traces))
        .route("/shadow-savings/:org", get(shadow_savings))
        .route("/cache-stats/:org", get(cache_stats))
        .route("/anomalies", get(active_anomalies))
        .route("/policies/current", get(current_policy))
        .route("/policies", put(update_policy))
        .route("/waf/rules", get(waf_rules))
        .route("/waf/rules/:id", put(toggle_waf_rule))
        .route("/control/pause-all", post(pause_all))
        .route("/control/resume-all", post(resume_all))
        .route("/control/pause-agent", post(pause_agent))
        .route("/control/resume-agent", post(resume_agent))
        .route("/control/revoke-token", post(revoke_token))
        .route("/control/emergency-stop", post(emergency_stop))
        .route("/control/emergency-reset", post(emergency_reset))
        .route("/control/status", get(control_status))
        .route("/anomalies/:id/resolve", post(resolve_anomaly))
}

// ─────────────────────────────────────────────────────────────────────────────
// Read endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// Burn rate from the per-minute KV counters: current rate, the linear
/// hourly projection, and a 60-minute history.
async fn burn_rate(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> ApiResult<Json<Value>> {
    let now = Utc::now();
    let mut history = Vec::with_capacity(60);
    let mut current_rate = 0.0;
    for offset in (0..60).rev() {
        let minute = now - ChronoDuration::minutes(offset);
        let bucket = minute.format("%Y%m%d%H%M").to_string();
        let cost = read_float(&state, &format!("cost:{org}:{bucket}")).await;
        let requests = read_int(&state, &format!("req:{org}:{bucket}")).await;
        if offset == 0 {
            current_rate = cost;
        }
        history.push(json!({
            "minute": minute.format("%H:%M").to_string(),
            "cost": cost,
            "requests": requests,
        }));
    }
    Ok(Json(json!({
        "currentRate": current_rate,
        "hourlyProjection": current_rate * 60.0,
        "history": history,
    })))
}

async fn read_float(state: &AppState, key: &str) -> f64 {
    match state.kv.get(key).await {
        Ok(Some(raw)) => raw.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

async fn read_int(state: &AppState, key: &str) -> i64 {
    match state.kv.get(key).await {
        Ok(Some(raw)) => raw.parse().unwrap_or(0),
        _ => 0,
    }
}

async fn agents(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> ApiResult<Json<Value>> {
    let agents = state.store.agents_by_org(&org).await?;
    Ok(Json(json!({ "agents": agents })))
}

#[derive(Deserialize)]
struct TraceQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn traces(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Query(query): Query<TraceQuery>,
) -> ApiResult<Json<Value>> {
    let traces = state.store.recent_traces(&org, query.limit).await?;
    Ok(Json(json!({ "traces": traces })))
}

async fn blocked_traces(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Query(query): Query<TraceQuery>,
) -> ApiResult<Json<Value>> {
    let traces = state.store.blocked_traces(&org, query.limit).await?;
    Ok(Json(json!({ "traces": traces })))
}

#[derive(Deserialize)]
struct HoursQuery {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

async fn shadow_traces(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Query(query): Query<HoursQuery>,
) -> ApiResult<Json<Value>> {
    let traces = state.store.shadow_traces(&org, query.hours).await?;
    Ok(Json(json!({ "traces": traces })))
}

async fn shadow_savings(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Query(query): Query<HoursQuery>,
) -> ApiResult<Json<Value>> {
    let savings = state.store.shadow_savings(&org, query.hours).await?;
    Ok(Json(json!({
        "shadowBlockedCount": savings.shadow_blocked_count,
        "totalMitigatedCost": savings.total_mitigated_cost,
        "periodHours": query.hours,
    })))
}

async fn cache_stats(
    State(state): State<AppState>,
    Path(org): Path<String>,
) -> ApiResult<Json<Value>> {
    let stats = state.store.cache_stats(&org).await?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

#[derive(Deserialize)]
struct OrgQuery {
    org: String,
}

async fn active_anomalies(
    State(state): State<AppState>,
    Query(query): Query<OrgQuery>,
) -> ApiResult<Json<Value>> {
    let anomalies = state.store.active_anomalies(&query.org).await?;
    Ok(Json(json!({ "anomalies": anomalies })))
}

async fn current_policy(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.policy.snapshot().as_ref()).unwrap_or_default())
}

async fn waf_rules(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "rules": state.waf.list() }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutations
// ─────────────────────────────────────────────────────────────────────────────

/// Partial policy update. Last writer wins; the merged document is
/// swapped atomically and mirrored to the KV store.
async fn update_policy(
    State(state): State<AppState>,
    Json(update): Json<PolicyUpdate>,
) -> ApiResult<Json<Value>> {
    let next = state.policy.apply_update(&update).await;
    if let Err(e) = state.store.save_policy("default", next.as_ref()).await {
        tracing::warn!(error = %e, "Policy persistence failed, snapshot still active");
    }
    state.emit_event(
        EventType::PolicyUpdated,
        None,
        serde_json::to_value(next.as_ref()).unwrap_or_default(),
    );
    info!(version = next.version, "Policy updated");
    Ok(Json(serde_json::to_value(next.as_ref()).unwrap_or_default()))
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_waf_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult<Json<Value>> {
    if !state.waf.set_enabled(&rule_id, body.enabled) {
        return Err(SwitchboardError::Config(format!("unknown WAF rule '{rule_id}'")).into());
    }
    state.emit_event(
        EventType::WafRuleUpdated,
        None,
        json!({ "rule_id": rule_id, "enabled": body.enabled }),
    );
    Ok(Json(json!({ "rule_id": rule_id, "enabled": body.enabled })))
}

async fn pause_all(State(state): State<AppState>) -> Json<Value> {
    state.controls.set_global_pause(true);
    state.emit_event(EventType::GlobalPauseStatus, None, json!({ "paused": true }));
    info!("Global pause engaged");
    Json(json!({ "paused": true }))
}

async fn resume_all(State(state): State<AppState>) -> Json<Value> {
    state.controls.set_global_pause(false);
    state.emit_event(EventType::GlobalPauseStatus, None, json!({ "paused": false }));
    info!("Global pause lifted");
    Json(json!({ "paused": false }))
}

#[derive(Deserialize)]
struct AgentBody {
    #[serde(alias = "agentId")]
    agent_id: String,
}

async fn pause_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentBody>,
) -> ApiResult<Json<Value>> {
    state.controls.paused_agents.insert(body.agent_id.clone(), ());
    state
        .store
        .set_agent_status(&body.agent_id, AgentStatus::Paused)
        .await?;
    state.emit_event(
        EventType::AgentStatus,
        None,
        json!({ "agent_id": body.agent_id, "status": "paused" }),
    );
    Ok(Json(json!({ "agent_id": body.agent_id, "status": "paused" })))
}

async fn resume_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentBody>,
) -> ApiResult<Json<Value>> {
    state.controls.paused_agents.remove(&body.agent_id);
    state
        .store
        .set_agent_status(&body.agent_id, AgentStatus::Active)
        .await?;
    state.emit_event(
        EventType::AgentStatus,
        None,
        json!({ "agent_id": body.agent_id, "status": "active" }),
    );
    Ok(Json(json!({ "agent_id": body.agent_id, "status": "active" })))
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

async fn revoke_token(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> ApiResult<Json<Value>> {
    let org = state
        .store
        .revoke_org_token(&body.token)
        .await?
        .ok_or_else(|| SwitchboardError::Config("unknown token".to_string()))?;
    // Drop the KV shortcut so in-flight callers lose access immediately.
    let _ = state.kv.delete(&format!("org:token:{}", body.token)).await;
    state.emit_event(
        EventType::AgentStatus,
        Some(&org.org_id),
        json!({ "org_id": org.org_id, "status": "revoked" }),
    );
    info!(org = %org.org_id, "Organisation token revoked");
    Ok(Json(json!({ "org_id": org.org_id, "revoked": true })))
}

async fn emergency_stop(State(state): State<AppState>) -> Json<Value> {
    state.traffic.trigger_emergency_stop();
    state.emit_event(EventType::EmergencyStop, None, json!({ "stopped": true }));
    info!("EMERGENCY STOP engaged");
    Json(json!({ "stopped": true }))
}

async fn emergency_reset(State(state): State<AppState>) -> Json<Value> {
    state.traffic.reset_emergency_stop();
    state.emit_event(EventType::EmergencyStop, None, json!({ "stopped": false }));
    info!("Emergency stop reset");
    Json(json!({ "stopped": false }))
}

async fn control_status(State(state): State<AppState>) -> Json<Value> {
    let paused_agents: Vec<String> = state
        .controls
        .paused_agents
        .iter()
        .map(|entry| entry.key().clone())
        .collect();
    Json(json!({
        "globalPause": state.controls.is_globally_paused(),
        "emergencyStop": state.traffic.is_stopped(),
        "pausedAgents": paused_agents,
        "subscribers": state.fanout.subscriber_count(),
        "bufferedTraces": state.recorder.buffered().await,
    }))
}

#[derive(Deserialize, Default)]
struct ResolveBody {
    #[serde(default)]
    resolved_by: Option<String>,
}

async fn resolve_anomaly(
    State(state): State<AppState>,
    Path(anomaly_id): Path<Uuid>,
    body: Option<Json<ResolveBody>>,
) -> ApiResult<Json<Value>> {
    let resolved_by = body
        .and_then(|Json(b)| b.resolved_by)
        .unwrap_or_else(|| "operator".to_string());
    let resolved = state
        .store
        .resolve_anomaly(anomaly_id, &resolved_by)
        .await?;
    if !resolved {
        return Err(SwitchboardError::Config(format!(
            "anomaly '{anomaly_id}' not found or already resolved"
        ))
        .into());
    }
    state.emit_event(
        EventType::AnomalyDetected,
        None,
        json!({ "anomaly_id": anomaly_id, "status": "resolved", "resolved_by": resolved_by }),
    );
    Ok(Json(json!({ "anomaly_id": anomaly_id, "status": "resolved" })))
}
