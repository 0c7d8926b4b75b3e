//! The event fan-out: long-lived subscribers with org filters and
//! interest sets, receiving best-effort broadcasts.
//!
//! Each subscriber owns a bounded mpsc receiver. A closed subscriber is
//! dropped from the map on the next broadcast; a full one just misses the
//! message. Nothing here ever blocks a request.

use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Capacity of each subscriber's channel.
const SUBSCRIBER_BUFFER: usize = 64;

/// Every event type pushed to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStatus,
    BurnRate,
    AnomalyDetected,
    TraceEvent,
    GlobalPauseStatus,
    AgentBlocked,
    PolicyUpdated,
    WafRuleUpdated,
    EmergencyStop,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStatus => "agent_status",
            Self::BurnRate => "burn_rate",
            Self::AnomalyDetected => "anomaly_detected",
            Self::TraceEvent => "trace_event",
            Self::GlobalPauseStatus => "global_pause_status",
            Self::AgentBlocked => "agent_blocked",
            Self::PolicyUpdated => "policy_updated",
            Self::WafRuleUpdated => "waf_rule_updated",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

/// The wire envelope pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    /// ISO-8601.
    pub timestamp: String,
}

struct Subscriber {
    org_filter: Option<String>,
    interests: Option<HashSet<EventType>>,
    tx: mpsc::Sender<EventEnvelope>,
}

impl Subscriber {
    fn wants(&self, event_type: EventType, org_id: Option<&str>) -> bool {
        if let Some(ref interests) = self.interests {
            if !interests.contains(&event_type) {
                return false;
            }
        }
        match (&self.org_filter, org_id) {
            // Org-scoped subscriber sees its own org's events plus globals.
            (Some(filter), Some(org)) => filter == org,
            _ => true,
        }
    }
}

/// Subscribable per-tenant push channel.
#[derive(Default)]
pub struct EventFanout {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. `org_filter: None` sees every org;
    /// `interests: None` sees every event type.
    pub fn subscribe(
        &self,
        org_filter: Option<String>,
        interests: Option<HashSet<EventType>>,
    ) -> (Uuid, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                org_filter,
                interests,
                tx,
            },
        );
        debug!(subscriber = %id, total = self.subscribers.len(), "Fan-out subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Broadcast an event. Best-effort: closed subscribers are removed,
    /// full ones miss this message.
    pub fn emit(&self, event_type: EventType, org_id: Option<&str>, payload: serde_json::Value) {
        let envelope = EventEnvelope {
            event_type,
            payload,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut closed: Vec<Uuid> = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.value().wants(event_type, org_id) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                entry.value().tx.try_send(envelope.clone())
            {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_matching_subscriber() {
        let fanout = EventFanout::new();
        let (_, mut rx) = fanout.subscribe(None, None);
        fanout.emit(EventType::AgentBlocked, Some("org_a"), json!({"agent": "a1"}));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, EventType::AgentBlocked);
        assert_eq!(envelope.payload["agent"], "a1");
        // RFC 3339 timestamp parses back.
        assert!(chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_org_filter() {
        let fanout = EventFanout::new();
        let (_, mut rx) = fanout.subscribe(Some("org_a".to_string()), None);
        fanout.emit(EventType::TraceEvent, Some("org_b"), json!({}));
        fanout.emit(EventType::TraceEvent, Some("org_a"), json!({"n": 1}));
        // Global events pass every filter.
        fanout.emit(EventType::EmergencyStop, None, json!({}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["n"], 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::EmergencyStop);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_interest_set_filters_types() {
        let fanout = EventFanout::new();
        let interests: HashSet<EventType> = [EventType::AnomalyDetected].into_iter().collect();
        let (_, mut rx) = fanout.subscribe(None, Some(interests));
        fanout.emit(EventType::TraceEvent, None, json!({}));
        fanout.emit(EventType::AnomalyDetected, None, json!({}));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, EventType::AnomalyDetected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let fanout = EventFanout::new();
        let (_, rx) = fanout.subscribe(None, None);
        assert_eq!(fanout.subscriber_count(), 1);
        drop(rx);
        fanout.emit(EventType::TraceEvent, None, json!({}));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let fanout = EventFanout::new();
        let (id, _rx) = fanout.subscribe(None, None);
        fanout.unsubscribe(id);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::GlobalPauseStatus).unwrap(),
            "\"global_pause_status\""
        );
        assert_eq!(EventType::WafRuleUpdated.as_str(), "waf_rule_updated");
    }
}
