//! The semantic firewall: layered admission control over agent traffic.
//!
//! The pipeline runs Bloom → PII regex → dangerous patterns → WAF →
//! intent → policy → risk, in that order; the first stage producing a
//! non-allow decision terminates the pipeline. Under shadow mode a
//! would-be denial is converted into an allowed `shadow_blocked` decision
//! with the original reason and risk preserved. Any internal failure
//! fails open as `audited` at risk 50.

pub mod bloom;
pub mod intent;
pub mod patterns;
pub mod waf;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::body::{extract_max_tokens, extract_model, serialize_body};
use crate::error::{Result, SwitchboardError};
use crate::policy::{PolicyDocument, PolicyLoader};
use crate::types::{ActionTaken, IntentCategory};
use bloom::PiiPrefilter;
use waf::WafRuleSet;

/// Risk assigned to a confirmed PII denial.
const PII_RISK: f64 = 90.0;
/// Risk assigned to a dangerous-pattern denial.
const DANGEROUS_RISK: f64 = 95.0;
/// Risk assigned when evaluation itself failed.
const EVALUATION_ERROR_RISK: f64 = 50.0;
/// Decisions above this risk are audited rather than plainly allowed.
const AUDIT_THRESHOLD: f64 = 70.0;

/// The request view the firewall evaluates.
pub struct FirewallRequest<'a> {
    pub body: &'a Value,
    pub method: &'a str,
    pub path: &'a str,
}

/// The firewall's verdict on one request.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub action: ActionTaken,
    pub reason: Option<String>,
    pub risk_score: f64,
    pub intent_category: Option<IntentCategory>,
    pub latency_ms: f64,
    pub is_shadow_event: bool,
    pub policy_id: String,
    /// Present when a WAF `redact` rule rewrote the body; this copy is
    /// what gets cached and forwarded.
    pub rewritten_body: Option<Value>,
}

/// Layered pattern/intent classifier with a hot-reloadable policy.
pub struct SemanticFirewall {
    policy: Arc<PolicyLoader>,
    waf: Arc<WafRuleSet>,
    prefilter: PiiPrefilter,
    /// Environment-level shadow override, OR-ed with the policy flag.
    shadow_env: bool,
}

impl SemanticFirewall {
    pub fn new(policy: Arc<PolicyLoader>, waf: Arc<WafRuleSet>, shadow_env: bool) -> Self {
        Self {
            policy,
            waf,
            prefilter: PiiPrefilter::new(),
            shadow_env,
        }
    }

    /// Evaluate a request. Never fails: internal errors degrade to an
    /// audited fail-open decision.
    pub fn evaluate(&self, request: &FirewallRequest<'_>) -> Decision {
        let started = Instant::now();
        let policy = self.policy.snapshot();
        let shadow = self.shadow_env || policy.shadow_mode;

        let mut decision = match self.evaluate_inner(request, &policy) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Firewall evaluation error, failing open");
                Decision {
                    allowed: true,
                    action: ActionTaken::Audited,
                    reason: Some("evaluation error".to_string()),
                    risk_score: EVALUATION_ERROR_RISK,
                    intent_category: None,
                    latency_ms: 0.0,
                    is_shadow_event: false,
                    policy_id: policy.policy_id.clone(),
                    rewritten_body: None,
                }
            }
        };

        // Shadow conversion changes only {allowed, action, is_shadow_event}.
        if shadow && decision.action == ActionTaken::Blocked {
            decision.allowed = true;
            decision.action = ActionTaken::ShadowBlocked;
            decision.is_shadow_event = true;
        }

        decision.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            action = decision.action.as_str(),
            risk = decision.risk_score,
            latency_ms = decision.latency_ms,
            "Firewall decision"
        );
        decision
    }

    fn evaluate_inner(
        &self,
        request: &FirewallRequest<'_>,
        policy: &PolicyDocument,
    ) -> Result<Decision> {
        let text = serialize_body(request.body);
        if text.len() > 4 * 1024 * 1024 {
            return Err(SwitchboardError::Evaluation(
                "body too large to scan".to_string(),
            ));
        }

        let deny = |reason: String, risk: f64, intent: Option<IntentCategory>| Decision {
            allowed: false,
            action: ActionTaken::Blocked,
            reason: Some(reason),
            risk_score: risk,
            intent_category: intent,
            latency_ms: 0.0,
            is_shadow_event: false,
            policy_id: policy.policy_id.clone(),
            rewritten_body: None,
        };

        // Stages 1+2: Bloom pre-filter, then PII confirmation. A negative
        // pre-filter skips the regex bank entirely.
        if policy.rules.block_pii && self.prefilter.may_contain_pii(&text) {
            if let Some(class) = patterns::match_pii(&text) {
                return Ok(deny(format!("PII detected: {class}"), PII_RISK, None));
            }
        }

        // Stage 3: dangerous patterns.
        if policy.rules.block_destructive {
            if let Some(class) = patterns::match_dangerous(&text) {
                return Ok(deny(
                    format!("dangerous pattern detected: {class}"),
                    DANGEROUS_RISK,
                    None,
                ));
            }
        }

        // Stage 4: WAF rules. May deny or rewrite the working copy.
        let waf_evaluation = self.waf.evaluate(&text);
        if let Some((rule_name, score)) = waf_evaluation.blocked {
            return Ok(deny(format!("WAF rule matched: {rule_name}"), score, None));
        }
        let scan_text = waf_evaluation.redacted.as_deref().unwrap_or(&text);
        let rewritten_body = match waf_evaluation.redacted.as_deref() {
            Some(redacted) => rewrite_body(request.body, redacted),
            None => None,
        };

        // Stage 5: intent classification on the (possibly redacted) text.
        let score = intent::classify(scan_text);
        let intent_category = Some(score.category);

        // Stage 6: policy checks.
        if score.category != IntentCategory::Unknown && policy.blocks_intent(score.category) {
            return Ok(deny(
                format!("intent '{}' blocked by policy", score.category),
                (score.raw_score * 10.0).clamp(40.0, 100.0),
                intent_category,
            ));
        }
        if policy.rules.block_external_calls && score.category == IntentCategory::ExternalCall {
            return Ok(deny(
                "external calls blocked by policy".to_string(),
                (score.raw_score * 10.0).clamp(40.0, 100.0),
                intent_category,
            ));
        }
        if let Some(model) = extract_model(request.body) {
            if !policy.allows_model(model) {
                return Ok(deny(
                    format!("model '{model}' not in policy allow-list"),
                    40.0,
                    intent_category,
                ));
            }
        }
        if let (Some(limit), Some(requested)) = (
            policy.rules.max_tokens_per_request,
            extract_max_tokens(request.body),
        ) {
            if requested > limit {
                return Ok(deny(
                    format!("max_tokens {requested} exceeds policy limit {limit}"),
                    40.0,
                    intent_category,
                ));
            }
        }

        // Stage 7: risk score.
        let mut base = 20.0 + score.category.weight();
        if request.method.eq_ignore_ascii_case("DELETE") {
            base += 20.0;
        }
        if request.path.to_lowercase().contains("admin") {
            base += 10.0;
        }
        let risk_score = (base * score.confidence).clamp(0.0, 100.0);

        let action = if risk_score > AUDIT_THRESHOLD {
            ActionTaken::Audited
        } else {
            ActionTaken::Allowed
        };

        Ok(Decision {
            allowed: true,
            action,
            reason: None,
            risk_score,
            intent_category,
            latency_ms: 0.0,
            is_shadow_event: false,
            policy_id: policy.policy_id.clone(),
            rewritten_body,
        })
    }
}

/// Re-parse a redacted working copy back into a JSON body. Redaction only
/// touches characters inside string values for the built-in rules, but a
/// custom pattern could break the JSON; in that case the original body
/// stands and the redaction is advisory.
fn rewrite_body(original: &Value, redacted: &str) -> Option<Value> {
    if original.is_string() {
        return Some(Value::String(redacted.to_string()));
    }
    serde_json::from_str(redacted).ok()
}
