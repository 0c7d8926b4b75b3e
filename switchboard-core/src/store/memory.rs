//! In-memory trace store for tests and database-less deployments.
//!
//! Mirrors the `PgStore` semantics closely enough that the integration
//! suite exercises the real pipeline against it: expiry filtering, upsert
//! keys, and linear-scan cosine ANN all behave like the durable backend.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AgentTokenStats, CacheStats, ShadowSavings, TraceStore};
use crate::embedding::cosine_distance;
use crate::error::Result;
use crate::policy::PolicyDocument;
use crate::types::{
    AgentRecord, AgentStatus, AnomalyRecord, CacheEntry, Organisation, TraceRecord,
};
use async_trait::async_trait;

#[derive(Default)]
struct Inner {
    traces: Vec<TraceRecord>,
    orgs: Vec<Organisation>,
    agents: HashMap<String, AgentRecord>,
    policies: HashMap<String, PolicyDocument>,
    anomalies: Vec<AnomalyRecord>,
    cache: HashMap<(String, String, String), CacheEntry>,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a demo organisation for the given
    /// token, so the proxy is usable out of the box.
    pub async fn with_demo_org(token: &str) -> Self {
        let store = Self::new();
        store
            .seed_org(Organisation {
                org_id: "org_demo".to_string(),
                name: "Demo Organisation".to_string(),
                api_token: token.to_string(),
                settings: serde_json::json!({}),
                daily_budget: 100.0,
                is_active: true,
                created_at: Utc::now(),
            })
            .await;
        store
    }

    /// Insert an organisation directly (test and bootstrap helper).
    pub async fn seed_org(&self, org: Organisation) {
        self.inner.lock().await.orgs.push(org);
    }

    /// Number of stored traces (test helper).
    pub async fn trace_count(&self) -> usize {
        self.inner.lock().await.traces.len()
    }
}

#[async_trait]
impl TraceStore for MemoryStore {
    async fn insert_traces(&self, traces: &[TraceRecord]) -> Result<()> {
        self.inner.lock().await.traces.extend_from_slice(traces);
        Ok(())
    }

    async fn recent_traces(&self, org_id: &str, limit: i64) -> Result<Vec<TraceRecord>> {
        let inner = self.inner.lock().await;
        let mut traces: Vec<TraceRecord> = inner
            .traces
            .iter()
            .filter(|t| t.org_id == org_id)
            .cloned()
            .collect();
        traces.sort_by(|a, b| b.ts.cmp(&a.ts));
        traces.truncate(limit.max(0) as usize);
        Ok(traces)
    }

    async fn blocked_traces(&self, org_id: &str, limit: i64) -> Result<Vec<TraceRecord>> {
        let inner = self.inner.lock().await;
        let mut traces: Vec<TraceRecord> = inner
            .traces
            .iter()
            .filter(|t| t.org_id == org_id && t.action_taken == crate::types::ActionTaken::Blocked)
            .cloned()
            .collect();
        traces.sort_by(|a, b| b.ts.cmp(&a.ts));
        traces.truncate(limit.max(0) as usize);
        Ok(traces)
    }

    async fn shadow_traces(&self, org_id: &str, hours: i64) -> Result<Vec<TraceRecord>> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours.max(0));
        let inner = self.inner.lock().await;
        let mut traces: Vec<TraceRecord> = inner
            .traces
            .iter()
            .filter(|t| t.org_id == org_id && t.is_shadow_event && t.ts >= cutoff)
            .cloned()
            .collect();
        traces.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(traces)
    }

    async fn shadow_savings(&self, org_id: &str, hours: i64) -> Result<ShadowSavings> {
        let traces = self.shadow_traces(org_id, hours).await?;
        Ok(ShadowSavings {
            shadow_blocked_count: traces.len() as i64,
            total_mitigated_cost: traces.iter().filter_map(|t| t.cost_usd).sum(),
        })
    }

    async fn traces_since(&self, window: ChronoDuration) -> Result<Vec<TraceRecord>> {
        let cutoff = Utc::now() - window;
        let inner = self.inner.lock().await;
        Ok(inner
            .traces
            .iter()
            .filter(|t| t.ts >= cutoff)
            .cloned()
            .collect())
    }

    async fn agent_token_stats(
        &self,
        hours: i64,
        min_traces: i64,
    ) -> Result<Vec<AgentTokenStats>> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours.max(0));
        let inner = self.inner.lock().await;
        let mut grouped: HashMap<(String, String), Vec<f64>> = HashMap::new();
        for trace in inner.traces.iter().filter(|t| t.ts >= cutoff) {
            let total = trace.input_tokens.unwrap_or(0) + trace.output_tokens.unwrap_or(0);
            grouped
                .entry((trace.agent_id.clone(), trace.org_id.clone()))
                .or_default()
                .push(total as f64);
        }
        let mut stats = Vec::new();
        for ((agent_id, org_id), totals) in grouped {
            if (totals.len() as i64) < min_traces {
                continue;
            }
            let count = totals.len() as f64;
            let mean = totals.iter().sum::<f64>() / count;
            let variance = totals.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / count;
            stats.push(AgentTokenStats {
                agent_id,
                org_id,
                mean,
                stddev: variance.sqrt(),
                trace_count: totals.len() as i64,
            });
        }
        Ok(stats)
    }

    async fn org_by_token(&self, token: &str) -> Result<Option<Organisation>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .orgs
            .iter()
            .find(|o| o.api_token == token && o.is_active)
            .cloned())
    }

    async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.agents.get_mut(&agent.agent_id) {
            Some(existing) => {
                if agent.name.is_some() {
                    existing.name = agent.name.clone();
                }
                if agent.framework.is_some() {
                    existing.framework = agent.framework.clone();
                }
            }
            None => {
                inner.agents.insert(agent.agent_id.clone(), agent.clone());
            }
        }
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.inner.lock().await.agents.get(agent_id).cloned())
    }

    async fn agents_by_org(&self, org_id: &str) -> Result<Vec<AgentRecord>> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<AgentRecord> = inner
            .agents
            .values()
            .filter(|a| a.org_id == org_id)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_org_token(&self, token: &str) -> Result<Option<Organisation>> {
        let mut inner = self.inner.lock().await;
        let org = match inner.orgs.iter_mut().find(|o| o.api_token == token) {
            Some(org) => {
                org.is_active = false;
                org.clone()
            }
            None => return Ok(None),
        };
        for agent in inner.agents.values_mut().filter(|a| a.org_id == org.org_id) {
            agent.status = AgentStatus::Revoked;
        }
        Ok(Some(org))
    }

    async fn save_policy(&self, org_id: &str, policy: &PolicyDocument) -> Result<()> {
        self.inner
            .lock()
            .await
            .policies
            .insert(org_id.to_string(), policy.clone());
        Ok(())
    }

    async fn load_policy(&self, org_id: &str) -> Result<Option<PolicyDocument>> {
        Ok(self.inner.lock().await.policies.get(org_id).cloned())
    }

    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<()> {
        self.inner.lock().await.anomalies.push(anomaly.clone());
        Ok(())
    }

    async fn resolve_anomaly(&self, anomaly_id: Uuid, resolved_by: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner
            .anomalies
            .iter_mut()
            .find(|a| a.anomaly_id == anomaly_id && a.status == crate::types::AnomalyStatus::Active)
        {
            Some(anomaly) => {
                anomaly.status = crate::types::AnomalyStatus::Resolved;
                anomaly.resolved_at = Some(Utc::now());
                anomaly.resolved_by = Some(resolved_by.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_anomalies(&self, org_id: &str) -> Result<Vec<AnomalyRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .anomalies
            .iter()
            .filter(|a| a.org_id == org_id && a.status == crate::types::AnomalyStatus::Active)
            .cloned()
            .collect())
    }

    async fn cache_upsert(&self, entry: &CacheEntry) -> Result<()> {
        let key = (
            entry.org_id.clone(),
            entry.model.clone(),
            entry.prompt_hash.clone(),
        );
        self.inner.lock().await.cache.insert(key, entry.clone());
        Ok(())
    }

    async fn cache_nearest(
        &self,
        org_id: &str,
        model: &str,
        embedding: &[f32],
    ) -> Result<Option<(CacheEntry, f32)>> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut best: Option<(CacheEntry, f32)> = None;
        for entry in inner.cache.values() {
            if entry.org_id != org_id || entry.model != model || entry.expires_at <= now {
                continue;
            }
            let distance = cosine_distance(embedding, &entry.prompt_embedding);
            if best.as_ref().map_or(true, |(_, d)| distance < *d) {
                best = Some((entry.clone(), distance));
            }
        }
        Ok(best)
    }

    async fn cache_record_hit(&self, cache_id: Uuid, cost_saved: f64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for entry in inner.cache.values_mut() {
            if entry.cache_id == cache_id {
                entry.hit_count += 1;
                entry.cost_saved += cost_saved;
                break;
            }
        }
        Ok(())
    }

    async fn cache_stats(&self, org_id: &str) -> Result<CacheStats> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut stats = CacheStats::default();
        for entry in inner.cache.values() {
            if entry.org_id != org_id || entry.expires_at <= now {
                continue;
            }
            stats.entries += 1;
            stats.total_hits += entry.hit_count;
            stats.total_cost_saved += entry.cost_saved;
        }
        Ok(stats)
    }
}
