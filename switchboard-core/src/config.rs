//! Runtime configuration loaded from environment variables.
//!
//! Invalid values never abort startup: each falls back to its default with
//! a structured warning, so a typo in one knob cannot take the proxy down.

use std::time::Duration;

use tracing::warn;

/// Process-wide configuration. Built once at startup and shared immutably.
#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// Listen port for the combined proxy + control surface.
    pub port: u16,
    /// Redis connection URL. Unset selects the in-memory KV backend.
    pub redis_url: Option<String>,
    /// TimescaleDB connection URL. Unset selects the in-memory trace store.
    pub timescale_url: Option<String>,
    /// Upstream base URLs, keyed by provider.
    pub upstream_openai: String,
    pub upstream_anthropic: String,
    pub upstream_google: String,
    /// Soft latency budget for the firewall, reported not enforced.
    pub firewall_max_latency_ms: u64,
    pub firewall_block_destructive: bool,
    pub firewall_block_pii: bool,
    /// Environment-level shadow mode override (OR-ed with the policy flag).
    pub shadow_mode: bool,
    /// Path to the YAML policy document, hot-reloaded on change.
    pub policies_config_path: Option<String>,
    /// Path to the YAML worker-script registry.
    pub workers_config_path: Option<String>,
    pub lock_ttl: Duration,
    pub max_queue_depth: u32,
    /// Initial emergency-stop state.
    pub emergency_stop_enabled: bool,
    pub log_level: Option<String>,
    /// TTL for semantic cache entries.
    pub cache_ttl: Duration,
    /// Maximum cosine distance for an ANN cache hit.
    pub cache_similarity_threshold: f32,
    /// Timeout for forwarded upstream requests.
    pub upstream_timeout: Duration,
    /// Token of the organisation seeded into the in-memory store.
    pub demo_org_token: String,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            timescale_url: None,
            upstream_openai: "https://api.openai.com".to_string(),
            upstream_anthropic: "https://api.anthropic.com".to_string(),
            upstream_google: "https://generativelanguage.googleapis.com".to_string(),
            firewall_max_latency_ms: 10,
            firewall_block_destructive: true,
            firewall_block_pii: true,
            shadow_mode: false,
            policies_config_path: None,
            workers_config_path: None,
            lock_ttl: Duration::from_secs(30),
            max_queue_depth: 5,
            emergency_stop_enabled: false,
            log_level: None,
            cache_ttl: Duration::from_secs(86_400),
            cache_similarity_threshold: 0.10,
            upstream_timeout: Duration::from_secs(30),
            demo_org_token: "demo_token_abc123".to_string(),
        }
    }
}

impl SwitchboardConfig {
    /// Load configuration from environment variables, warning and keeping
    /// the default for any value that fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT", defaults.port),
            redis_url: env_opt("REDIS_URL"),
            timescale_url: env_opt("TIMESCALE_URL"),
            upstream_openai: env_string("UPSTREAM_OPENAI", &defaults.upstream_openai),
            upstream_anthropic: env_string("UPSTREAM_ANTHROPIC", &defaults.upstream_anthropic),
            upstream_google: env_string("UPSTREAM_GOOGLE", &defaults.upstream_google),
            firewall_max_latency_ms: env_parse(
                "FIREWALL_MAX_LATENCY_MS",
                defaults.firewall_max_latency_ms,
            ),
            firewall_block_destructive: env_bool("FIREWALL_BLOCK_DESTRUCTIVE", true),
            firewall_block_pii: env_bool("FIREWALL_BLOCK_PII", true),
            shadow_mode: env_bool("SHADOW_MODE", false),
            policies_config_path: env_opt("POLICIES_CONFIG_PATH"),
            workers_config_path: env_opt("WORKERS_CONFIG_PATH"),
            lock_ttl: Duration::from_secs(env_parse("LOCK_TTL_SECONDS", 30u64)),
            max_queue_depth: env_parse("MAX_QUEUE_DEPTH", defaults.max_queue_depth),
            emergency_stop_enabled: env_bool("EMERGENCY_STOP_ENABLED", false),
            log_level: env_opt("LOG_LEVEL"),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 86_400u64)),
            cache_similarity_threshold: env_parse(
                "CACHE_SIMILARITY_THRESHOLD",
                defaults.cache_similarity_threshold,
            ),
            upstream_timeout: Duration::from_secs(env_parse("UPSTREAM_TIMEOUT_SECS", 30u64)),
            demo_org_token: env_string("DEMO_ORG_TOKEN", &defaults.demo_org_token),
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(
                    env_var = name,
                    value = other,
                    default,
                    "Invalid boolean for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
