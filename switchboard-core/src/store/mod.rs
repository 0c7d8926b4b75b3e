//! Storage adapters: the KV store and the time-series trace store.
//!
//! Both are traits so the request path depends only on the contract.
//! Production wires `RedisKv` + `PgStore`; tests and store-less
//! deployments wire the in-memory twins.

pub mod kv;
pub mod memory;
pub mod pg;

pub use kv::{KvStore, MemoryKv, RedisKv};
pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use uuid::Uuid;

use crate::error::Result;
use crate::policy::PolicyDocument;
use crate::types::{
    AgentRecord, AgentStatus, AnomalyRecord, CacheEntry, Organisation, TraceRecord,
};

/// Per-agent token statistics over a trailing window, for anomaly scoring.
#[derive(Debug, Clone)]
pub struct AgentTokenStats {
    pub agent_id: String,
    pub org_id: String,
    pub mean: f64,
    pub stddev: f64,
    pub trace_count: i64,
}

/// Aggregate over shadow-blocked traffic in a trailing window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShadowSavings {
    pub shadow_blocked_count: i64,
    pub total_mitigated_cost: f64,
}

/// Aggregate over the semantic cache for one organisation.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub total_hits: i64,
    pub total_cost_saved: f64,
}

/// Durable time-series store contract: traces, organisations, agents,
/// policies, anomalies, and the semantic cache rows with ANN lookup.
#[async_trait]
pub trait TraceStore: Send + Sync {
    // ── Traces ───────────────────────────────────────────────────────────

    /// Append a batch of traces. All-or-nothing per batch.
    async fn insert_traces(&self, traces: &[TraceRecord]) -> Result<()>;

    /// Most recent traces for an organisation, newest first.
    async fn recent_traces(&self, org_id: &str, limit: i64) -> Result<Vec<TraceRecord>>;

    /// Most recent blocked traces for an organisation.
    async fn blocked_traces(&self, org_id: &str, limit: i64) -> Result<Vec<TraceRecord>>;

    /// Shadow events for an organisation within the trailing window.
    async fn shadow_traces(&self, org_id: &str, hours: i64) -> Result<Vec<TraceRecord>>;

    /// Count and mitigated cost of shadow events within the window.
    async fn shadow_savings(&self, org_id: &str, hours: i64) -> Result<ShadowSavings>;

    /// All traces across organisations newer than `window`, for the
    /// anomaly scan.
    async fn traces_since(&self, window: ChronoDuration) -> Result<Vec<TraceRecord>>;

    /// Token statistics per agent over the trailing `hours`, restricted to
    /// agents with at least `min_traces` traces.
    async fn agent_token_stats(
        &self,
        hours: i64,
        min_traces: i64,
    ) -> Result<Vec<AgentTokenStats>>;

    // ── Organisations & agents ───────────────────────────────────────────

    /// Resolve an API token to its active organisation.
    async fn org_by_token(&self, token: &str) -> Result<Option<Organisation>>;

    /// Insert the agent if unseen; refresh name/framework otherwise.
    /// Never overwrites a non-active status.
    async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()>;

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>>;

    async fn agents_by_org(&self, org_id: &str) -> Result<Vec<AgentRecord>>;

    /// Set an agent's status. Returns whether the agent existed.
    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool>;

    /// Deactivate the organisation owning `token` and revoke its agents.
    /// Returns the organisation when one matched.
    async fn revoke_org_token(&self, token: &str) -> Result<Option<Organisation>>;

    // ── Policies ─────────────────────────────────────────────────────────

    async fn save_policy(&self, org_id: &str, policy: &PolicyDocument) -> Result<()>;

    async fn load_policy(&self, org_id: &str) -> Result<Option<PolicyDocument>>;

    // ── Anomalies ────────────────────────────────────────────────────────

    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<()>;

    /// Mark an anomaly resolved. Returns whether it existed and was active.
    async fn resolve_anomaly(&self, anomaly_id: Uuid, resolved_by: &str) -> Result<bool>;

    async fn active_anomalies(&self, org_id: &str) -> Result<Vec<AnomalyRecord>>;

    // ── Semantic cache ───────────────────────────────────────────────────

    /// Insert or replace on `(org_id, model, prompt_hash)`.
    async fn cache_upsert(&self, entry: &CacheEntry) -> Result<()>;

    /// Nearest non-expired entry for `(org, model)` by cosine distance,
    /// with its distance.
    async fn cache_nearest(
        &self,
        org_id: &str,
        model: &str,
        embedding: &[f32],
    ) -> Result<Option<(CacheEntry, f32)>>;

    /// Bump hit accounting for an entry.
    async fn cache_record_hit(&self, cache_id: Uuid, cost_saved: f64) -> Result<()>;

    async fn cache_stats(&self, org_id: &str) -> Result<CacheStats>;
}
