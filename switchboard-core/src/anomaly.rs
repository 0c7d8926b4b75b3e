//! The anomaly detector: a periodic statistical scan over recent traces.
//!
//! Every 60 s, agents with at least 10 traces in the trailing 24 h get a
//! token-usage baseline (mean and population stddev). Traces from the
//! last 5 minutes whose total token count sits more than 3 sigma out are
//! flagged; above 5 sigma the anomaly is critical. The detector is
//! idempotent per trace: a flagged trace never produces a second event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventFanout, EventType};
use crate::store::TraceStore;
use crate::types::{AnomalyRecord, AnomalyStatus, Severity};

/// Scan cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);
/// Baseline window and minimum sample size.
const BASELINE_HOURS: i64 = 24;
const MIN_TRACES: i64 = 10;
/// Scan window for fresh traces.
const RECENT_WINDOW_MINUTES: i64 = 5;
/// Z-score thresholds.
const FLAG_THRESHOLD: f64 = 3.0;
const CRITICAL_THRESHOLD: f64 = 5.0;
/// Bound on the seen-trace dedupe set.
const SEEN_CAP: usize = 10_000;

/// Periodic scanner over captured traces.
pub struct AnomalyDetector {
    store: Arc<dyn TraceStore>,
    fanout: Arc<EventFanout>,
    seen: Mutex<SeenSet>,
}

/// Insertion-ordered set with a size bound.
#[derive(Default)]
struct SeenSet {
    set: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenSet {
    /// Insert; returns `false` when the id was already present.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > SEEN_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn TraceStore>, fanout: Arc<EventFanout>) -> Self {
        Self {
            store,
            fanout,
            seen: Mutex::new(SeenSet::default()),
        }
    }

    /// One scan pass. Returns the number of anomalies emitted.
    pub async fn scan(&self) -> usize {
        let stats = match self.store.agent_token_stats(BASELINE_HOURS, MIN_TRACES).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Anomaly baseline query failed, skipping scan");
                return 0;
            }
        };
        if stats.is_empty() {
            return 0;
        }
        let baselines: HashMap<&str, _> = stats
            .iter()
            .map(|s| (s.agent_id.as_str(), s))
            .collect();

        let recent = match self
            .store
            .traces_since(ChronoDuration::minutes(RECENT_WINDOW_MINUTES))
            .await
        {
            Ok(traces) => traces,
            Err(e) => {
                warn!(error = %e, "Anomaly recent-trace query failed, skipping scan");
                return 0;
            }
        };

        let mut emitted = 0;
        for trace in recent {
            let baseline = match baselines.get(trace.agent_id.as_str()) {
                Some(baseline) => *baseline,
                None => continue,
            };
            if baseline.stddev <= f64::EPSILON {
                continue;
            }
            let total = (trace.input_tokens.unwrap_or(0) + trace.output_tokens.unwrap_or(0)) as f64;
            let z_score = (total - baseline.mean) / baseline.stddev;
            if z_score <= FLAG_THRESHOLD {
                continue;
            }

            if !self.seen.lock().await.insert(trace.trace_id) {
                continue;
            }

            let severity = if z_score > CRITICAL_THRESHOLD {
                Severity::Critical
            } else {
                Severity::High
            };
            let anomaly = AnomalyRecord {
                anomaly_id: Uuid::new_v4(),
                org_id: trace.org_id.clone(),
                agent_id: trace.agent_id.clone(),
                kind: "token_usage_spike".to_string(),
                severity,
                details: serde_json::json!({
                    "trace_id": trace.trace_id,
                    "total_tokens": total,
                    "mean": baseline.mean,
                    "stddev": baseline.stddev,
                    "z_score": z_score,
                }),
                detected_at: Utc::now(),
                status: AnomalyStatus::Active,
                resolved_at: None,
                resolved_by: None,
            };

            if let Err(e) = self.store.insert_anomaly(&anomaly).await {
                warn!(error = %e, "Anomaly insert failed");
            }
            self.fanout.emit(
                EventType::AnomalyDetected,
                Some(&anomaly.org_id),
                serde_json::to_value(&anomaly).unwrap_or_default(),
            );
            info!(
                agent = %anomaly.agent_id,
                z_score,
                severity = severity.as_str(),
                "Token usage anomaly detected"
            );
            emitted += 1;
        }
        emitted
    }

    /// Background scan loop until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCAN_INTERVAL);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        detector.scan().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Anomaly detector shutting down");
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
    use crate::store::{MemoryStore, TraceStore as _};
    use crate::types::{ActionTaken, TraceRecord};

    fn trace(agent: &str, tokens: i64) -> TraceRecord {
        TraceRecord {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            ts: Utc::now(),
            duration_ms: 1.0,
            org_id: "org_a".to_string(),
            agent_id: agent.to_string(),
            agent_name: None,
            agent_framework: None,
            request_type: "chat_completion".to_string(),
            intent_category: None,
            risk_score: 0.0,
            model_provider: None,
            model_name: None,
            input_tokens: Some(tokens),
            output_tokens: Some(0),
            cost_usd: None,
            request_body: serde_json::json!({}),
            response_body: serde_json::json!({}),
            reasoning_steps: vec![],
            tool_calls: vec![],
            policy_applied: None,
            action_taken: ActionTaken::Allowed,
            block_reason: None,
            is_shadow_event: false,
            client_ip: None,
            user_agent: None,
            custom_metadata: serde_json::json!({}),
        }
    }

    async fn store_with_spike() -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        // Baseline: 19 traces around 100 tokens with a little variance,
        // then one extreme outlier.
        let mut traces: Vec<TraceRecord> = (0..19)
            .map(|i| trace("busy", 95 + (i % 3) * 5))
            .collect();
        let spike = trace("busy", 5_000);
        let spike_id = spike.trace_id;
        traces.push(spike);
        store.insert_traces(&traces).await.unwrap();
        (store, spike_id)
    }

    #[tokio::test]
    async fn test_spike_is_flagged_once() {
        let (store, _) = store_with_spike().await;
        let fanout = Arc::new(EventFanout::new());
        let (_, mut rx) = fanout.subscribe(None, None);
        let detector = AnomalyDetector::new(store.clone(), fanout);

        assert_eq!(detector.scan().await, 1);
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, EventType::AnomalyDetected);
        assert_eq!(envelope.payload["agent_id"], "busy");
        assert_eq!(store.active_anomalies("org_a").await.unwrap().len(), 1);

        // Idempotence: a second scan over the same traces emits nothing.
        assert_eq!(detector.scan().await, 0);
    }

    #[tokio::test]
    async fn test_quiet_agent_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        // Under the 10-trace minimum even with a spike.
        let mut traces: Vec<TraceRecord> = (0..5).map(|_| trace("quiet", 100)).collect();
        traces.push(trace("quiet", 50_000));
        store.insert_traces(&traces).await.unwrap();

        let detector = AnomalyDetector::new(store, Arc::new(EventFanout::new()));
        assert_eq!(detector.scan().await, 0);
    }

    #[tokio::test]
    async fn test_zero_variance_never_divides() {
        let store = Arc::new(MemoryStore::new());
        let traces: Vec<TraceRecord> = (0..12).map(|_| trace("steady", 100)).collect();
        store.insert_traces(&traces).await.unwrap();
        let detector = AnomalyDetector::new(store, Arc::new(EventFanout::new()));
        assert_eq!(detector.scan().await, 0);
    }

    #[test]
    fn test_seen_set_is_bounded() {
        let mut seen = SeenSet::default();
        let first = Uuid::new_v4();
        assert!(seen.insert(first));
        assert!(!seen.insert(first));
        for _ in 0..SEEN_CAP {
            seen.insert(Uuid::new_v4());
        }
        assert!(seen.set.len() <= SEEN_CAP);
        // The oldest id was evicted and can be inserted again.
        assert!(seen.insert(first));
    }
}
