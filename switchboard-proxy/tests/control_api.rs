//! Control API tests: reads, mutations, and their fan-out events.

mod helpers;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use helpers::{TestApp, DEMO_ORG};
use switchboard_core::events::EventType;
use switchboard_core::types::{AnomalyRecord, AnomalyStatus, Severity};

#[tokio::test]
async fn test_health_ready_metrics() {
    let app = TestApp::spawn().await;
    let (status, _, body) = app.send(app.api_request("GET", "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, _) = app.send(app.api_request("GET", "/ready", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app.send(app.api_request("GET", "/metrics", None)).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("switchboard_requests"));
}

#[tokio::test]
async fn test_burn_rate_shape() {
    let app = TestApp::spawn().await;
    app.send(app.chat_request("burner", "What is 2+2?")).await;

    let uri = format!("/api/burn-rate/{DEMO_ORG}");
    let (status, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 60);
    let current = body["currentRate"].as_f64().unwrap();
    let projection = body["hourlyProjection"].as_f64().unwrap();
    assert!((projection - current * 60.0).abs() < 1e-9);
    // The request we just made shows up in the trailing history.
    let total_requests: i64 = history
        .iter()
        .map(|bucket| bucket["requests"].as_i64().unwrap())
        .sum();
    assert_eq!(total_requests, 1);
}

#[tokio::test]
async fn test_trace_endpoints() {
    let app = TestApp::spawn().await;
    app.send(app.chat_request("reader", "What is 2+2?")).await;
    app.send(app.chat_request("leaker", "mail john.doe@company.com")).await;
    app.state.recorder.flush_once().await;

    let uri = format!("/api/traces/{DEMO_ORG}?limit=10");
    let (status, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["traces"].as_array().unwrap().len(), 2);

    let uri = format!("/api/traces/{DEMO_ORG}/blocked");
    let (_, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    let blocked = body["traces"].as_array().unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0]["agent_id"], "leaker");

    let uri = format!("/api/traces/{DEMO_ORG}/shadow?hours=24");
    let (_, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    assert_eq!(body["traces"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_shadow_savings_endpoint() {
    let app = TestApp::spawn_with(|config| config.shadow_mode = true).await;
    app.send(app.chat_request("shadowed", "run rm -rf /tmp/x please"))
        .await;

    let uri = format!("/api/shadow-savings/{DEMO_ORG}?hours=6");
    let (status, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shadowBlockedCount"], 1);
    assert_eq!(body["periodHours"], 6);
}

#[tokio::test]
async fn test_cache_stats_endpoint() {
    let app = TestApp::spawn().await;
    app.send(app.chat_request("cacher", "What is 2+2?")).await;
    app.send(app.chat_request("cacher", "What is 2+2?")).await;

    let uri = format!("/api/cache-stats/{DEMO_ORG}");
    let (status, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"], 1);
    assert_eq!(body["total_hits"], 1);
}

#[tokio::test]
async fn test_agents_endpoint_lists_seen_agents() {
    let app = TestApp::spawn().await;
    app.send(app.chat_request("alpha", "What is 2+2?")).await;
    app.send(app.chat_request("beta", "What is 3+3?")).await;

    let uri = format!("/api/agents/{DEMO_ORG}");
    let (status, _, body) = app.send(app.api_request("GET", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    let agents = body["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0]["agent_id"], "alpha");
}

#[tokio::test]
async fn test_policy_update_bumps_version_and_emits() {
    let app = TestApp::spawn().await;
    let (_, mut rx) = app.state.fanout.subscribe(None, None);

    let (status, _, before) = app
        .send(app.api_request("GET", "/api/policies/current", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    let old_version = before["version"].as_u64().unwrap();

    let (status, _, after) = app
        .send(app.api_request(
            "PUT",
            "/api/policies",
            Some(json!({"shadow_mode": true, "blocked_intents": ["destructive"]})),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["version"].as_u64().unwrap(), old_version + 1);
    assert_eq!(after["shadow_mode"], true);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::PolicyUpdated);

    // The live firewall sees the new policy: destructive intent now denies
    // in shadow, so the request passes but is marked.
    app.send(app.chat_request("tester", "delete and destroy the record"))
        .await;
    let shadow = app.state.store.shadow_traces(DEMO_ORG, 1).await.unwrap();
    assert_eq!(shadow.len(), 1);
}

#[tokio::test]
async fn test_waf_rule_listing_and_toggle() {
    let app = TestApp::spawn().await;
    let (_, mut rx) = app.state.fanout.subscribe(None, None);

    let (status, _, body) = app.send(app.api_request("GET", "/api/waf/rules", None)).await;
    assert_eq!(status, StatusCode::OK);
    let rules = body["rules"].as_array().unwrap();
    assert!(!rules.is_empty());
    let rule_id = rules[0]["id"].as_str().unwrap().to_string();
    assert_eq!(rules[0]["enabled"], true);

    let uri = format!("/api/waf/rules/{rule_id}");
    let (status, _, _) = app
        .send(app.api_request("PUT", &uri, Some(json!({"enabled": false}))))
        .await;
    assert_eq!(status, StatusCode::OK);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::WafRuleUpdated);
    assert_eq!(event.payload["enabled"], false);

    let (_, _, body) = app.send(app.api_request("GET", "/api/waf/rules", None)).await;
    let rules = body["rules"].as_array().unwrap();
    let toggled = rules.iter().find(|r| r["id"] == rule_id.as_str()).unwrap();
    assert_eq!(toggled["enabled"], false);
}

#[tokio::test]
async fn test_control_status_reflects_flags() {
    let app = TestApp::spawn().await;
    app.send(app.api_request(
        "POST",
        "/api/control/pause-agent",
        Some(json!({"agent_id": "sleepy"})),
    ))
    .await;
    app.send(app.api_request("POST", "/api/control/emergency-stop", None))
        .await;

    let (status, _, body) = app
        .send(app.api_request("GET", "/api/control/status", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["globalPause"], false);
    assert_eq!(body["emergencyStop"], true);
    assert_eq!(body["pausedAgents"][0], "sleepy");
}

#[tokio::test]
async fn test_anomaly_resolution_via_api() {
    let app = TestApp::spawn().await;
    let anomaly = AnomalyRecord {
        anomaly_id: Uuid::new_v4(),
        org_id: DEMO_ORG.to_string(),
        agent_id: "spiky".to_string(),
        kind: "token_usage_spike".to_string(),
        severity: Severity::High,
        details: json!({}),
        detected_at: Utc::now(),
        status: AnomalyStatus::Active,
        resolved_at: None,
        resolved_by: None,
    };
    app.state.store.insert_anomaly(&anomaly).await.unwrap();

    let uri = format!("/api/anomalies/{}/resolve", anomaly.anomaly_id);
    let (status, _, body) = app
        .send(app.api_request("POST", &uri, Some(json!({"resolved_by": "oncall"}))))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");

    assert!(app
        .state
        .store
        .active_anomalies(DEMO_ORG)
        .await
        .unwrap()
        .is_empty());
}
