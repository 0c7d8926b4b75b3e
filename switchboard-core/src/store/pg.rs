//! TimescaleDB-backed trace store over `sqlx`.
//!
//! Bootstrap creates the hypertable with its compression and retention
//! policies plus the continuous aggregates. The Timescale- and
//! pgvector-specific statements are applied best-effort so the store also
//! comes up against a plain Postgres during development; the base tables
//! are mandatory.
//!
//! Embeddings cross the wire as pgvector text literals (`[0.1,0.2,...]`)
//! cast with `::vector`, and come back out via `::text`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{AgentTokenStats, CacheStats, ShadowSavings, TraceStore};
use crate::error::{Result, SwitchboardError};
use crate::policy::PolicyDocument;
use crate::types::{
    ActionTaken, AgentRecord, AgentStatus, AnomalyRecord, AnomalyStatus, CacheEntry,
    IntentCategory, Organisation, Severity, TraceRecord,
};

/// Statements that must succeed for the store to come up.
const BASE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS organizations (
        org_id        TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        api_token     TEXT NOT NULL UNIQUE,
        settings      JSONB NOT NULL DEFAULT '{}',
        daily_budget  DOUBLE PRECISION NOT NULL DEFAULT 0,
        is_active     BOOLEAN NOT NULL DEFAULT TRUE,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS agents (
        agent_id    TEXT PRIMARY KEY,
        org_id      TEXT NOT NULL,
        name        TEXT,
        framework   TEXT,
        status      TEXT NOT NULL DEFAULT 'active',
        rate_limit  INTEGER,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS policies (
        org_id     TEXT PRIMARY KEY,
        document   JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS anomalies (
        anomaly_id  UUID PRIMARY KEY,
        org_id      TEXT NOT NULL,
        agent_id    TEXT NOT NULL,
        type        TEXT NOT NULL,
        severity    TEXT NOT NULL,
        details     JSONB NOT NULL DEFAULT '{}',
        detected_at TIMESTAMPTZ NOT NULL,
        status      TEXT NOT NULL DEFAULT 'active',
        resolved_at TIMESTAMPTZ,
        resolved_by TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS agent_traces (
        trace_id        UUID NOT NULL,
        span_id         UUID NOT NULL,
        parent_span_id  UUID,
        ts              TIMESTAMPTZ NOT NULL,
        duration_ms     DOUBLE PRECISION NOT NULL,
        org_id          TEXT NOT NULL,
        agent_id        TEXT NOT NULL,
        agent_name      TEXT,
        agent_framework TEXT,
        request_type    TEXT NOT NULL,
        intent_category TEXT,
        risk_score      DOUBLE PRECISION NOT NULL,
        model_provider  TEXT,
        model_name      TEXT,
        input_tokens    BIGINT,
        output_tokens   BIGINT,
        cost_usd        DOUBLE PRECISION,
        request_body    JSONB NOT NULL DEFAULT '{}',
        response_body   JSONB NOT NULL DEFAULT '{}',
        reasoning_steps TEXT[] NOT NULL DEFAULT '{}',
        tool_calls      JSONB NOT NULL DEFAULT '[]',
        policy_applied  TEXT,
        action_taken    TEXT NOT NULL,
        block_reason    TEXT,
        is_shadow_event BOOLEAN NOT NULL DEFAULT FALSE,
        client_ip       TEXT,
        user_agent      TEXT,
        custom_metadata JSONB NOT NULL DEFAULT '{}'
    )"#,
    "CREATE INDEX IF NOT EXISTS agent_traces_org_ts_idx ON agent_traces (org_id, ts DESC)",
    "CREATE INDEX IF NOT EXISTS agent_traces_agent_ts_idx ON agent_traces (agent_id, ts DESC)",
];

/// Timescale/pgvector statements, applied best-effort.
const EXTENDED_SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS timescaledb",
    "CREATE EXTENSION IF NOT EXISTS vector",
    "SELECT create_hypertable('agent_traces', 'ts', chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE, migrate_data => TRUE)",
    "ALTER TABLE agent_traces SET (timescaledb.compress, timescaledb.compress_segmentby = 'org_id')",
    "SELECT add_compression_policy('agent_traces', INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT add_retention_policy('agent_traces', INTERVAL '90 days', if_not_exists => TRUE)",
    r#"CREATE TABLE IF NOT EXISTS semantic_cache (
        cache_id         UUID PRIMARY KEY,
        org_id           TEXT NOT NULL,
        model            TEXT NOT NULL,
        prompt_hash      TEXT NOT NULL,
        prompt_embedding VECTOR(384),
        prompt_text      TEXT NOT NULL,
        response_text    TEXT NOT NULL,
        response_tokens  BIGINT,
        hit_count        BIGINT NOT NULL DEFAULT 0,
        cost_saved       DOUBLE PRECISION NOT NULL DEFAULT 0,
        created_at       TIMESTAMPTZ NOT NULL,
        expires_at       TIMESTAMPTZ NOT NULL,
        UNIQUE (org_id, model, prompt_hash)
    )"#,
    "CREATE INDEX IF NOT EXISTS semantic_cache_ann_idx ON semantic_cache USING ivfflat (prompt_embedding vector_cosine_ops)",
    r#"CREATE MATERIALIZED VIEW IF NOT EXISTS hourly_costs
        WITH (timescaledb.continuous) AS
        SELECT org_id, time_bucket('1 hour', ts) AS bucket,
               sum(cost_usd) AS cost, count(*) AS requests
        FROM agent_traces GROUP BY org_id, bucket
        WITH NO DATA"#,
    r#"CREATE MATERIALIZED VIEW IF NOT EXISTS hourly_shadow_savings
        WITH (timescaledb.continuous) AS
        SELECT org_id, time_bucket('1 hour', ts) AS bucket,
               count(*) AS shadow_blocked, sum(cost_usd) AS mitigated_cost
        FROM agent_traces WHERE is_shadow_event GROUP BY org_id, bucket
        WITH NO DATA"#,
    r#"CREATE MATERIALIZED VIEW IF NOT EXISTS cache_stats_hourly
        WITH (timescaledb.continuous) AS
        SELECT org_id, time_bucket('1 hour', ts) AS bucket, count(*) AS requests
        FROM agent_traces WHERE request_type = 'cache_hit' GROUP BY org_id, bucket
        WITH NO DATA"#,
];

/// TimescaleDB store.
pub struct PgStore {
    pool: PgPool,
}

fn db_err(err: sqlx::Error) -> SwitchboardError {
    SwitchboardError::Storage(err.to_string())
}

fn embedding_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn parse_embedding(text: &str) -> Vec<f32> {
    text.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

fn parse_action(text: &str) -> ActionTaken {
    match text {
        "allowed" => ActionTaken::Allowed,
        "audited" => ActionTaken::Audited,
        "modified" => ActionTaken::Modified,
        "blocked" => ActionTaken::Blocked,
        "shadow_blocked" => ActionTaken::ShadowBlocked,
        _ => ActionTaken::Allowed,
    }
}

fn parse_intent(text: &str) -> IntentCategory {
    match text {
        "destructive" => IntentCategory::Destructive,
        "data_access" => IntentCategory::DataAccess,
        "data_modification" => IntentCategory::DataModification,
        "external_call" => IntentCategory::ExternalCall,
        "code_execution" => IntentCategory::CodeExecution,
        "file_operation" => IntentCategory::FileOperation,
        _ => IntentCategory::Unknown,
    }
}

fn parse_status(text: &str) -> AgentStatus {
    match text {
        "paused" => AgentStatus::Paused,
        "revoked" => AgentStatus::Revoked,
        "warning" => AgentStatus::Warning,
        _ => AgentStatus::Active,
    }
}

fn parse_severity(text: &str) -> Severity {
    match text {
        "low" => Severity::Low,
        "medium" => Severity::Medium,
        "critical" => Severity::Critical,
        _ => Severity::High,
    }
}

fn row_to_trace(row: &sqlx::postgres::PgRow) -> std::result::Result<TraceRecord, sqlx::Error> {
    let intent: Option<String> = row.try_get("intent_category")?;
    let action: String = row.try_get("action_taken")?;
    let tool_calls: serde_json::Value = row.try_get("tool_calls")?;
    Ok(TraceRecord {
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        parent_span_id: row.try_get("parent_span_id")?,
        ts: row.try_get("ts")?,
        duration_ms: row.try_get("duration_ms")?,
        org_id: row.try_get("org_id")?,
        agent_id: row.try_get("agent_id")?,
        agent_name: row.try_get("agent_name")?,
        agent_framework: row.try_get("agent_framework")?,
        request_type: row.try_get("request_type")?,
        intent_category: intent.map(|i| parse_intent(&i)),
        risk_score: row.try_get("risk_score")?,
        model_provider: row.try_get("model_provider")?,
        model_name: row.try_get("model_name")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        cost_usd: row.try_get("cost_usd")?,
        request_body: row.try_get("request_body")?,
        response_body: row.try_get("response_body")?,
        reasoning_steps: row.try_get("reasoning_steps")?,
        tool_calls: tool_calls.as_array().cloned().unwrap_or_default(),
        policy_applied: row.try_get("policy_applied")?,
        action_taken: parse_action(&action),
        block_reason: row.try_get("block_reason")?,
        is_shadow_event: row.try_get("is_shadow_event")?,
        client_ip: row.try_get("client_ip")?,
        user_agent: row.try_get("user_agent")?,
        custom_metadata: row.try_get("custom_metadata")?,
    })
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> std::result::Result<AgentRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let rate_limit: Option<i32> = row.try_get("rate_limit")?;
    Ok(AgentRecord {
        agent_id: row.try_get("agent_id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        framework: row.try_get("framework")?,
        status: parse_status(&status),
        rate_limit: rate_limit.map(|r| r as u32),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_org(row: &sqlx::postgres::PgRow) -> std::result::Result<Organisation, sqlx::Error> {
    Ok(Organisation {
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        api_token: row.try_get("api_token")?,
        settings: row.try_get("settings")?,
        daily_budget: row.try_get("daily_budget")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_anomaly(row: &sqlx::postgres::PgRow) -> std::result::Result<AnomalyRecord, sqlx::Error> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    Ok(AnomalyRecord {
        anomaly_id: row.try_get("anomaly_id")?,
        org_id: row.try_get("org_id")?,
        agent_id: row.try_get("agent_id")?,
        kind: row.try_get("type")?,
        severity: parse_severity(&severity),
        details: row.try_get("details")?,
        detected_at: row.try_get("detected_at")?,
        status: if status == "resolved" {
            AnomalyStatus::Resolved
        } else {
            AnomalyStatus::Active
        },
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
    })
}

fn row_to_cache_entry(
    row: &sqlx::postgres::PgRow,
) -> std::result::Result<CacheEntry, sqlx::Error> {
    let embedding: Option<String> = row.try_get("embedding_text")?;
    Ok(CacheEntry {
        cache_id: row.try_get("cache_id")?,
        org_id: row.try_get("org_id")?,
        model: row.try_get("model")?,
        prompt_hash: row.try_get("prompt_hash")?,
        prompt_embedding: embedding.as_deref().map(parse_embedding).unwrap_or_default(),
        prompt_text: row.try_get("prompt_text")?,
        response_text: row.try_get("response_text")?,
        response_tokens: row.try_get("response_tokens")?,
        hit_count: row.try_get("hit_count")?,
        cost_saved: row.try_get("cost_saved")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

impl PgStore {
    /// Connect and run schema bootstrap.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        for statement in BASE_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        for statement in EXTENDED_SCHEMA {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                warn!(error = %e, "Timescale/pgvector bootstrap statement skipped");
            }
        }
        info!("Trace store schema ready");
        Ok(())
    }

    fn cutoff(hours: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::hours(hours.max(0))
    }
}

#[async_trait]
impl TraceStore for PgStore {
    async fn insert_traces(&self, traces: &[TraceRecord]) -> Result<()> {
        if traces.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for t in traces {
            sqlx::query(
                r#"INSERT INTO agent_traces (
                    trace_id, span_id, parent_span_id, ts, duration_ms, org_id,
                    agent_id, agent_name, agent_framework, request_type,
                    intent_category, risk_score, model_provider, model_name,
                    input_tokens, output_tokens, cost_usd, request_body,
                    response_body, reasoning_steps, tool_calls, policy_applied,
                    action_taken, block_reason, is_shadow_event, client_ip,
                    user_agent, custom_metadata
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,
                          $16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26,$27,$28)"#,
            )
            .bind(t.trace_id)
            .bind(t.span_id)
            .bind(t.parent_span_id)
            .bind(t.ts)
            .bind(t.duration_ms)
            .bind(&t.org_id)
            .bind(&t.agent_id)
            .bind(&t.agent_name)
            .bind(&t.agent_framework)
            .bind(&t.request_type)
            .bind(t.intent_category.map(|i| i.as_str().to_string()))
            .bind(t.risk_score)
            .bind(&t.model_provider)
            .bind(&t.model_name)
            .bind(t.input_tokens)
            .bind(t.output_tokens)
            .bind(t.cost_usd)
            .bind(&t.request_body)
            .bind(&t.response_body)
            .bind(&t.reasoning_steps)
            .bind(serde_json::Value::Array(t.tool_calls.clone()))
            .bind(&t.policy_applied)
            .bind(t.action_taken.as_str())
            .bind(&t.block_reason)
            .bind(t.is_shadow_event)
            .bind(&t.client_ip)
            .bind(&t.user_agent)
            .bind(&t.custom_metadata)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn recent_traces(&self, org_id: &str, limit: i64) -> Result<Vec<TraceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM agent_traces WHERE org_id = $1 ORDER BY ts DESC LIMIT $2",
        )
        .bind(org_id)
        .bind(limit.clamp(0, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| row_to_trace(r).map_err(db_err)).collect()
    }

    async fn blocked_traces(&self, org_id: &str, limit: i64) -> Result<Vec<TraceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM agent_traces WHERE org_id = $1 AND action_taken = 'blocked'
             ORDER BY ts DESC LIMIT $2",
        )
        .bind(org_id)
        .bind(limit.clamp(0, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| row_to_trace(r).map_err(db_err)).collect()
    }

    async fn shadow_traces(&self, org_id: &str, hours: i64) -> Result<Vec<TraceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM agent_traces WHERE org_id = $1 AND is_shadow_event AND ts >= $2
             ORDER BY ts DESC",
        )
        .bind(org_id)
        .bind(Self::cutoff(hours))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| row_to_trace(r).map_err(db_err)).collect()
    }

    async fn shadow_savings(&self, org_id: &str, hours: i64) -> Result<ShadowSavings> {
        let row = sqlx::query(
            "SELECT count(*) AS n, coalesce(sum(cost_usd), 0)::double precision AS mitigated
             FROM agent_traces WHERE org_id = $1 AND is_shadow_event AND ts >= $2",
        )
        .bind(org_id)
        .bind(Self::cutoff(hours))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(ShadowSavings {
            shadow_blocked_count: row.try_get("n").map_err(db_err)?,
            total_mitigated_cost: row.try_get("mitigated").map_err(db_err)?,
        })
    }

    async fn traces_since(&self, window: ChronoDuration) -> Result<Vec<TraceRecord>> {
        let rows = sqlx::query("SELECT * FROM agent_traces WHERE ts >= $1")
            .bind(Utc::now() - window)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(|r| row_to_trace(r).map_err(db_err)).collect()
    }

    async fn agent_token_stats(
        &self,
        hours: i64,
        min_traces: i64,
    ) -> Result<Vec<AgentTokenStats>> {
        let rows = sqlx::query(
            "SELECT agent_id, org_id,
                    avg(coalesce(input_tokens, 0) + coalesce(output_tokens, 0))::double precision AS mean,
                    coalesce(stddev_pop(coalesce(input_tokens, 0) + coalesce(output_tokens, 0)), 0)::double precision AS stddev,
                    count(*) AS trace_count
             FROM agent_traces WHERE ts >= $1
             GROUP BY agent_id, org_id
             HAVING count(*) >= $2",
        )
        .bind(Self::cutoff(hours))
        .bind(min_traces)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(AgentTokenStats {
                    agent_id: row.try_get("agent_id").map_err(db_err)?,
                    org_id: row.try_get("org_id").map_err(db_err)?,
                    mean: row.try_get("mean").map_err(db_err)?,
                    stddev: row.try_get("stddev").map_err(db_err)?,
                    trace_count: row.try_get("trace_count").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn org_by_token(&self, token: &str) -> Result<Option<Organisation>> {
        let row = sqlx::query(
            "SELECT * FROM organizations WHERE api_token = $1 AND is_active",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_org(&r).map_err(db_err)).transpose()
    }

    async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO agents (agent_id, org_id, name, framework, status, rate_limit, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (agent_id) DO UPDATE SET
                   name = coalesce(EXCLUDED.name, agents.name),
                   framework = coalesce(EXCLUDED.framework, agents.framework)"#,
        )
        .bind(&agent.agent_id)
        .bind(&agent.org_id)
        .bind(&agent.name)
        .bind(&agent.framework)
        .bind(agent.status.as_str())
        .bind(agent.rate_limit.map(|r| r as i32))
        .bind(agent.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_agent(&r).map_err(db_err)).transpose()
    }

    async fn agents_by_org(&self, org_id: &str) -> Result<Vec<AgentRecord>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE org_id = $1 ORDER BY agent_id")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(|r| row_to_agent(r).map_err(db_err)).collect()
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET status = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_org_token(&self, token: &str) -> Result<Option<Organisation>> {
        let row = sqlx::query(
            "UPDATE organizations SET is_active = FALSE WHERE api_token = $1 RETURNING *",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let org = match row {
            Some(r) => row_to_org(&r).map_err(db_err)?,
            None => return Ok(None),
        };
        sqlx::query("UPDATE agents SET status = 'revoked' WHERE org_id = $1")
            .bind(&org.org_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(Some(org))
    }

    async fn save_policy(&self, org_id: &str, policy: &PolicyDocument) -> Result<()> {
        let document = serde_json::to_value(policy)
            .map_err(|e| SwitchboardError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO policies (org_id, document, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (org_id) DO UPDATE SET document = EXCLUDED.document, updated_at = now()",
        )
        .bind(org_id)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_policy(&self, org_id: &str) -> Result<Option<PolicyDocument>> {
        let row = sqlx::query("SELECT document FROM policies WHERE org_id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => {
                let document: serde_json::Value = r.try_get("document").map_err(db_err)?;
                serde_json::from_value(document)
                    .map(Some)
                    .map_err(|e| SwitchboardError::Storage(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO anomalies (anomaly_id, org_id, agent_id, type, severity,
                                      details, detected_at, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
               ON CONFLICT (anomaly_id) DO NOTHING"#,
        )
        .bind(anomaly.anomaly_id)
        .bind(&anomaly.org_id)
        .bind(&anomaly.agent_id)
        .bind(&anomaly.kind)
        .bind(anomaly.severity.as_str())
        .bind(&anomaly.details)
        .bind(anomaly.detected_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn resolve_anomaly(&self, anomaly_id: Uuid, resolved_by: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE anomalies SET status = 'resolved', resolved_at = now(), resolved_by = $2
             WHERE anomaly_id = $1 AND status = 'active'",
        )
        .bind(anomaly_id)
        .bind(resolved_by)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_anomalies(&self, org_id: &str) -> Result<Vec<AnomalyRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM anomalies WHERE org_id = $1 AND status = 'active'
             ORDER BY detected_at DESC",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| row_to_anomaly(r).map_err(db_err))
            .collect()
    }

    async fn cache_upsert(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO semantic_cache (cache_id, org_id, model, prompt_hash,
                   prompt_embedding, prompt_text, response_text, response_tokens,
                   hit_count, cost_saved, created_at, expires_at)
               VALUES ($1, $2, $3, $4, $5::vector, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (org_id, model, prompt_hash) DO UPDATE SET
                   cache_id = EXCLUDED.cache_id,
                   prompt_embedding = EXCLUDED.prompt_embedding,
                   prompt_text = EXCLUDED.prompt_text,
                   response_text = EXCLUDED.response_text,
                   response_tokens = EXCLUDED.response_tokens,
                   created_at = EXCLUDED.created_at,
                   expires_at = EXCLUDED.expires_at"#,
        )
        .bind(entry.cache_id)
        .bind(&entry.org_id)
        .bind(&entry.model)
        .bind(&entry.prompt_hash)
        .bind(embedding_literal(&entry.prompt_embedding))
        .bind(&entry.prompt_text)
        .bind(&entry.response_text)
        .bind(entry.response_tokens)
        .bind(entry.hit_count)
        .bind(entry.cost_saved)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cache_nearest(
        &self,
        org_id: &str,
        model: &str,
        embedding: &[f32],
    ) -> Result<Option<(CacheEntry, f32)>> {
        let row = sqlx::query(
            r#"SELECT cache_id, org_id, model, prompt_hash,
                      prompt_embedding::text AS embedding_text, prompt_text,
                      response_text, response_tokens, hit_count, cost_saved,
                      created_at, expires_at,
                      (prompt_embedding <=> $3::vector) AS distance
               FROM semantic_cache
               WHERE org_id = $1 AND model = $2 AND expires_at > now()
               ORDER BY prompt_embedding <=> $3::vector
               LIMIT 1"#,
        )
        .bind(org_id)
        .bind(model)
        .bind(embedding_literal(embedding))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(r) => {
                let entry = row_to_cache_entry(&r).map_err(db_err)?;
                let distance: f64 = r.try_get("distance").map_err(db_err)?;
                Ok(Some((entry, distance as f32)))
            }
            None => Ok(None),
        }
    }

    async fn cache_record_hit(&self, cache_id: Uuid, cost_saved: f64) -> Result<()> {
        sqlx::query(
            "UPDATE semantic_cache SET hit_count = hit_count + 1, cost_saved = cost_saved + $2
             WHERE cache_id = $1",
        )
        .bind(cache_id)
        .bind(cost_saved)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cache_stats(&self, org_id: &str) -> Result<CacheStats> {
        let row = sqlx::query(
            "SELECT count(*) AS entries, coalesce(sum(hit_count), 0)::bigint AS hits,
                    coalesce(sum(cost_saved), 0)::double precision AS saved
             FROM semantic_cache WHERE org_id = $1 AND expires_at > now()",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(CacheStats {
            entries: row.try_get("entries").map_err(db_err)?,
            total_hits: row.try_get("hits").map_err(db_err)?,
            total_cost_saved: row.try_get("saved").map_err(db_err)?,
        })
    }
}
