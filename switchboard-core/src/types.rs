//! Shared data model: organisations, agents, traces, anomalies, cache rows.
//!
//! These types are the durable vocabulary of the system — they cross the
//! storage boundary, the event fan-out, and the control API unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An organisation. The API token is the sole authentication input; it is
/// unique across active organisations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organisation {
    pub org_id: String,
    pub name: String,
    pub api_token: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub daily_budget: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of an agent. A `paused` or `revoked` agent never
/// reaches an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Revoked,
    Warning,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Revoked => "revoked",
            Self::Warning => "warning",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent, auto-created on first observed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub org_id: String,
    pub name: Option<String>,
    pub framework: Option<String>,
    pub status: AgentStatus,
    /// Requests-per-minute budget. Tracked in counters, not enforced.
    pub rate_limit: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// What the pipeline ultimately did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Allowed,
    Audited,
    Modified,
    Blocked,
    ShadowBlocked,
}

impl ActionTaken {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Audited => "audited",
            Self::Modified => "modified",
            Self::Blocked => "blocked",
            Self::ShadowBlocked => "shadow_blocked",
        }
    }

    /// Denials are persisted synchronously before the response is written.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Blocked | Self::ShadowBlocked)
    }
}

/// Coarse classification of a request's apparent purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Destructive,
    DataAccess,
    DataModification,
    ExternalCall,
    CodeExecution,
    FileOperation,
    Unknown,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Destructive => "destructive",
            Self::DataAccess => "data_access",
            Self::DataModification => "data_modification",
            Self::ExternalCall => "external_call",
            Self::CodeExecution => "code_execution",
            Self::FileOperation => "file_operation",
            Self::Unknown => "unknown",
        }
    }

    /// The fixed keyword weight for this category.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Destructive => 1.5,
            Self::DataAccess => 0.5,
            Self::DataModification => 1.0,
            Self::ExternalCall => 1.2,
            Self::CodeExecution => 1.4,
            Self::FileOperation => 1.1,
            Self::Unknown => 0.0,
        }
    }

    /// The fixed keyword set for this category.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Destructive => &[
                "delete", "remove", "drop", "truncate", "destroy", "kill", "terminate",
            ],
            Self::DataAccess => &["select", "query", "fetch", "read", "get", "list", "search"],
            Self::DataModification => &["update", "insert", "upsert", "modify", "change", "set"],
            Self::ExternalCall => &["http", "api", "webhook", "curl", "fetch", "request", "post"],
            Self::CodeExecution => &[
                "exec", "eval", "run", "execute", "shell", "command", "script",
            ],
            Self::FileOperation => &[
                "file", "write", "save", "upload", "download", "path", "directory",
            ],
            Self::Unknown => &[],
        }
    }

    /// All classifiable categories, in scoring order.
    pub fn all() -> &'static [IntentCategory] {
        &[
            Self::Destructive,
            Self::DataAccess,
            Self::DataModification,
            Self::ExternalCall,
            Self::CodeExecution,
            Self::FileOperation,
        ]
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity scale shared by WAF rules and anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Risk score contributed by a blocking WAF rule of this severity.
    pub fn block_score(&self) -> f64 {
        match self {
            Self::Low => 20.0,
            Self::Medium => 40.0,
            Self::High => 70.0,
            Self::Critical => 100.0,
        }
    }
}

/// One captured request/response exchange. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    pub duration_ms: f64,
    pub org_id: String,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub agent_framework: Option<String>,
    pub request_type: String,
    pub intent_category: Option<IntentCategory>,
    pub risk_score: f64,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    /// Opaque request body; only the accessors in [`crate::body`] look inside.
    pub request_body: serde_json::Value,
    pub response_body: serde_json::Value,
    pub reasoning_steps: Vec<String>,
    pub tool_calls: Vec<serde_json::Value>,
    pub policy_applied: Option<String>,
    pub action_taken: ActionTaken,
    pub block_reason: Option<String>,
    pub is_shadow_event: bool,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub custom_metadata: serde_json::Value,
}

/// Status of a recorded anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Active,
    Resolved,
}

/// A statistical anomaly flagged by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub anomaly_id: Uuid,
    pub org_id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub status: AnomalyStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// A semantic cache row. Unique on `(org_id, model, prompt_hash)`; rows
/// past `expires_at` are invisible to lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_id: Uuid,
    pub org_id: String,
    pub model: String,
    pub prompt_hash: String,
    pub prompt_embedding: Vec<f32>,
    pub prompt_text: String,
    pub response_text: String,
    pub response_tokens: Option<i64>,
    pub hit_count: i64,
    pub cost_saved: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
