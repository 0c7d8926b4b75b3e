//! The flight recorder: buffered, batched, at-least-once trace capture.
//!
//! Denials take the immediate path — a synchronous write that completes
//! before the HTTP response is written, so a crash cannot lose the audit
//! of a block. Everything else lands in a bounded in-memory buffer that a
//! background task flushes every second in batches of up to 100. A failed
//! batch is re-prepended so order is preserved for retry; duplicates under
//! partial failure are acceptable because trace rows carry unique ids.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::body::{
    estimate_input_tokens, extract_reasoning_steps, extract_tool_calls, extract_usage,
};
use crate::error::Result;
use crate::firewall::Decision;
use crate::store::{KvStore, TraceStore};
use crate::types::{ActionTaken, AgentRecord, AgentStatus, TraceRecord};

/// Flush cadence for the buffered path.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum traces written per flush batch.
const FLUSH_BATCH: usize = 100;
/// Buffer bound; beyond this the oldest traces are dropped with a warning.
const BUFFER_CAP: usize = 10_000;
/// TTL for the per-minute burn/rate counters.
const COUNTER_TTL: Duration = Duration::from_secs(2 * 3600);

/// Fixed model price table, USD per token (input, output).
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-4-turbo", 1e-5, 3e-5),
    ("gpt-4", 3e-5, 6e-5),
    ("gpt-3.5-turbo", 5e-7, 1.5e-6),
    ("claude-3-opus", 1.5e-5, 7.5e-5),
    ("claude-3-sonnet", 3e-6, 1.5e-5),
    ("claude-3-haiku", 2.5e-7, 1.25e-6),
];
/// Unknown models are priced as gpt-3.5-turbo.
const FALLBACK_PRICE: (f64, f64) = (5e-7, 1.5e-6);

/// USD cost for a model and token counts. Longest-prefix match against the
/// price table, so dated variants like `gpt-4-turbo-2024-04-09` resolve.
pub fn derive_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let (input_price, output_price) = PRICE_TABLE
        .iter()
        .find(|(name, _, _)| model.starts_with(name))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(FALLBACK_PRICE);
    input_tokens as f64 * input_price + output_tokens as f64 * output_price
}

/// Per-request tracing context, created by the orchestrator at ingress.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    started: Instant,
}

impl TraceContext {
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Everything `record` needs beyond the context and the decision.
pub struct TraceData {
    pub org_id: String,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub agent_framework: Option<String>,
    pub request_type: String,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub request_body: serde_json::Value,
    pub response_body: serde_json::Value,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub custom_metadata: serde_json::Value,
}

/// Buffered trace ingestion with an immediate path for denials.
pub struct FlightRecorder {
    store: Arc<dyn TraceStore>,
    kv: Arc<dyn KvStore>,
    buffer: Mutex<VecDeque<TraceRecord>>,
}

impl FlightRecorder {
    pub fn new(store: Arc<dyn TraceStore>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            kv,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Open a context for one request, optionally nested under a parent.
    pub fn create_context(&self, parent: Option<&TraceContext>) -> TraceContext {
        TraceContext {
            trace_id: parent.map(|p| p.trace_id).unwrap_or_else(Uuid::new_v4),
            span_id: Uuid::new_v4(),
            parent_span_id: parent.map(|p| p.span_id),
            ts: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Derive and persist one trace. Denials are written synchronously;
    /// everything else is enqueued for the background flush. Returns the
    /// built record so callers can decorate the response.
    pub async fn record(
        &self,
        ctx: &TraceContext,
        decision: &Decision,
        data: TraceData,
    ) -> Result<TraceRecord> {
        let (mut input_tokens, output_tokens) = extract_usage(&data.response_body);
        if input_tokens.is_none() {
            let estimate = estimate_input_tokens(&data.request_body);
            if estimate > 0 {
                input_tokens = Some(estimate);
            }
        }
        let cost_usd = match (&data.model_name, input_tokens, output_tokens) {
            (Some(model), Some(input), output) => {
                Some(derive_cost(model, input, output.unwrap_or(0)))
            }
            _ => None,
        };

        let trace = TraceRecord {
            trace_id: ctx.trace_id,
            span_id: ctx.span_id,
            parent_span_id: ctx.parent_span_id,
            ts: ctx.ts,
            duration_ms: ctx.elapsed_ms(),
            org_id: data.org_id.clone(),
            agent_id: data.agent_id.clone(),
            agent_name: data.agent_name.clone(),
            agent_framework: data.agent_framework.clone(),
            request_type: data.request_type,
            intent_category: decision.intent_category,
            risk_score: decision.risk_score,
            model_provider: data.model_provider,
            model_name: data.model_name,
            input_tokens,
            output_tokens,
            cost_usd,
            reasoning_steps: extract_reasoning_steps(&data.request_body),
            tool_calls: extract_tool_calls(&data.response_body),
            request_body: data.request_body,
            response_body: data.response_body,
            policy_applied: Some(decision.policy_id.clone()),
            action_taken: decision.action,
            block_reason: decision.reason.clone(),
            is_shadow_event: decision.is_shadow_event,
            client_ip: data.client_ip,
            user_agent: data.user_agent,
            custom_metadata: data.custom_metadata,
        };

        // Agent upsert on first sight, best-effort.
        let agent = AgentRecord {
            agent_id: trace.agent_id.clone(),
            org_id: trace.org_id.clone(),
            name: trace.agent_name.clone(),
            framework: trace.agent_framework.clone(),
            status: AgentStatus::Active,
            rate_limit: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_agent(&agent).await {
            warn!(error = %e, "Agent upsert failed, continuing");
        }

        self.bump_counters(&trace).await;

        if decision.action.is_denial() {
            // Immediate path: persisted before the HTTP response goes out.
            // A storage failure here is escalated as a warning but the
            // denial response still stands.
            if let Err(e) = self.store.insert_traces(std::slice::from_ref(&trace)).await {
                error!(error = %e, trace_id = %trace.trace_id, "Immediate denial trace write failed");
            }
        } else {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= BUFFER_CAP {
                warn!(cap = BUFFER_CAP, "Trace buffer full, dropping oldest");
                buffer.pop_front();
            }
            buffer.push_back(trace.clone());
        }

        Ok(trace)
    }

    /// Per-minute burn and rate counters. Tracked, never enforced.
    async fn bump_counters(&self, trace: &TraceRecord) {
        let minute = trace.ts.format("%Y%m%d%H%M").to_string();
        let requests_key = format!("req:{}:{}", trace.org_id, minute);
        let rate_key = format!("rate:{}:{}", trace.agent_id, minute);
        if let Err(e) = self.kv.incr_by(&requests_key, 1, COUNTER_TTL).await {
            warn!(error = %e, "Request counter bump failed");
        }
        if let Err(e) = self.kv.incr_by(&rate_key, 1, COUNTER_TTL).await {
            warn!(error = %e, "Rate counter bump failed");
        }
        if let Some(cost) = trace.cost_usd {
            let cost_key = format!("cost:{}:{}", trace.org_id, minute);
            if let Err(e) = self.kv.incr_by_float(&cost_key, cost, COUNTER_TTL).await {
                warn!(error = %e, "Cost counter bump failed");
            }
        }
    }

    /// Number of traces waiting in the buffer.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Flush up to one batch. Returns how many traces were written.
    ///
    /// The buffer lock is held only while splicing the batch out and, on
    /// failure, while re-prepending it; the store write happens unlocked.
    pub async fn flush_once(&self) -> usize {
        let batch: Vec<TraceRecord> = {
            let mut buffer = self.buffer.lock().await;
            let take = buffer.len().min(FLUSH_BATCH);
            buffer.drain(..take).collect()
        };
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        match self.store.insert_traces(&batch).await {
            Ok(()) => {
                debug!(count, "Trace batch flushed");
                count
            }
            Err(e) => {
                warn!(error = %e, count, "Trace flush failed, re-queueing batch");
                let mut buffer = self.buffer.lock().await;
                for trace in batch.into_iter().rev() {
                    buffer.push_front(trace);
                }
                0
            }
        }
    }

    /// Background flush loop. Drains what it can once more on shutdown.
    pub fn spawn_flush(self: &Arc<Self>, shutdown: CancellationToken) {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        recorder.flush_once().await;
                    }
                    _ = shutdown.cancelled() => {
                        // Final drain: keep flushing until empty or the
                        // store refuses a batch.
                        while recorder.flush_once().await > 0 {}
                        debug!("Recorder flush task shut down");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryKv, MemoryStore, TraceStore as _};
    use crate::types::IntentCategory;
    use serde_json::json;

    fn decision(action: ActionTaken) -> Decision {
        Decision {
            allowed: !action.is_denial(),
            action,
            reason: action.is_denial().then(|| "test".to_string()),
            risk_score: 10.0,
            intent_category: Some(IntentCategory::DataAccess),
            latency_ms: 1.0,
            is_shadow_event: action == ActionTaken::ShadowBlocked,
            policy_id: "default".to_string(),
            rewritten_body: None,
        }
    }

    fn data(org: &str, agent: &str) -> TraceData {
        TraceData {
            org_id: org.to_string(),
            agent_id: agent.to_string(),
            agent_name: Some("Tester".to_string()),
            agent_framework: None,
            request_type: "chat_completion".to_string(),
            model_provider: Some("openai".to_string()),
            model_name: Some("gpt-3.5-turbo".to_string()),
            request_body: json!({"messages": [{"role": "user", "content": "hi"}]}),
            response_body: json!({"usage": {"prompt_tokens": 10, "completion_tokens": 20}}),
            client_ip: None,
            user_agent: None,
            custom_metadata: json!({}),
        }
    }

    fn recorder(store: Arc<MemoryStore>) -> Arc<FlightRecorder> {
        Arc::new(FlightRecorder::new(store, Arc::new(MemoryKv::new())))
    }

    #[test]
    fn test_cost_table() {
        assert!((derive_cost("gpt-4", 1000, 1000) - 0.09).abs() < 1e-9);
        assert!((derive_cost("gpt-4-turbo-2024-04-09", 1000, 0) - 0.01).abs() < 1e-9);
        assert!((derive_cost("claude-3-haiku-20240307", 1000, 1000) - 0.0015).abs() < 1e-9);
        // Unknown models fall back to gpt-3.5-turbo pricing.
        assert_eq!(
            derive_cost("mystery-model", 100, 100),
            derive_cost("gpt-3.5-turbo", 100, 100)
        );
    }

    #[tokio::test]
    async fn test_denial_is_written_immediately() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone());
        let ctx = recorder.create_context(None);
        recorder
            .record(&ctx, &decision(ActionTaken::Blocked), data("org_a", "agent_1"))
            .await
            .unwrap();
        // No flush has run, yet the denial is persisted.
        assert_eq!(store.trace_count().await, 1);
        assert_eq!(recorder.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_allowed_traces_are_buffered_until_flush() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone());
        let ctx = recorder.create_context(None);
        recorder
            .record(&ctx, &decision(ActionTaken::Allowed), data("org_a", "agent_1"))
            .await
            .unwrap();
        assert_eq!(store.trace_count().await, 0);
        assert_eq!(recorder.buffered().await, 1);

        assert_eq!(recorder.flush_once().await, 1);
        assert_eq!(store.trace_count().await, 1);
        assert_eq!(recorder.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_usage_and_cost_derivation() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone());
        let ctx = recorder.create_context(None);
        let trace = recorder
            .record(&ctx, &decision(ActionTaken::Allowed), data("org_a", "agent_1"))
            .await
            .unwrap();
        assert_eq!(trace.input_tokens, Some(10));
        assert_eq!(trace.output_tokens, Some(20));
        let expected = derive_cost("gpt-3.5-turbo", 10, 20);
        assert!((trace.cost_usd.unwrap() - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_input_tokens_estimated_when_usage_missing() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store);
        let ctx = recorder.create_context(None);
        let mut payload = data("org_a", "agent_1");
        payload.response_body = json!({});
        let trace = recorder
            .record(&ctx, &decision(ActionTaken::Allowed), payload)
            .await
            .unwrap();
        assert!(trace.input_tokens.unwrap() > 0);
        assert_eq!(trace.output_tokens, None);
    }

    #[tokio::test]
    async fn test_agent_upserted_on_first_sight() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone());
        let ctx = recorder.create_context(None);
        recorder
            .record(&ctx, &decision(ActionTaken::Allowed), data("org_a", "agent_7"))
            .await
            .unwrap();
        let agent = store.get_agent("agent_7").await.unwrap().unwrap();
        assert_eq!(agent.org_id, "org_a");
        assert_eq!(agent.name.as_deref(), Some("Tester"));
    }

    #[tokio::test]
    async fn test_child_context_links_spans() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store);
        let parent = recorder.create_context(None);
        let child = recorder.create_context(Some(&parent));
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_span_id, Some(parent.span_id));
        assert_ne!(child.span_id, parent.span_id);
    }
}
