//! The policy document: the switchboard's admission rules for one
//! organisation. Exactly one document is active at a time; it is swapped
//! atomically on file change or control-plane update.

pub mod loader;

pub use loader::PolicyLoader;

use serde::{Deserialize, Serialize};

use crate::types::IntentCategory;

/// Structured rule block inside a policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRules {
    #[serde(default = "default_true")]
    pub block_pii: bool,
    #[serde(default = "default_true")]
    pub block_destructive: bool,
    #[serde(default)]
    pub block_external_calls: bool,
    /// Empty means every model is allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub max_tokens_per_request: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            block_pii: true,
            block_destructive: true,
            block_external_calls: false,
            allowed_models: Vec::new(),
            max_tokens_per_request: None,
        }
    }
}

/// The active policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocument {
    #[serde(default = "default_policy_id")]
    pub policy_id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_burn_rate")]
    pub max_burn_rate_per_hour: f64,
    #[serde(default)]
    pub blocked_intents: Vec<IntentCategory>,
    #[serde(default)]
    pub pii_masking_enabled: bool,
    #[serde(default)]
    pub shadow_mode: bool,
    #[serde(default)]
    pub rules: PolicyRules,
}

fn default_policy_id() -> String {
    "default".to_string()
}

fn default_version() -> u32 {
    1
}

fn default_burn_rate() -> f64 {
    10.0
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            policy_id: default_policy_id(),
            version: default_version(),
            max_burn_rate_per_hour: default_burn_rate(),
            blocked_intents: Vec::new(),
            pii_masking_enabled: false,
            shadow_mode: false,
            rules: PolicyRules::default(),
        }
    }
}

impl PolicyDocument {
    /// Whether the given intent category is blocked by this policy.
    pub fn blocks_intent(&self, category: IntentCategory) -> bool {
        self.blocked_intents.contains(&category)
    }

    /// Whether the named model is admitted. An empty allow-list admits all.
    pub fn allows_model(&self, model: &str) -> bool {
        self.rules.allowed_models.is_empty()
            || self.rules.allowed_models.iter().any(|m| m == model)
    }
}

/// Partial update applied by `PUT /policies`. Absent fields keep their
/// current value; last writer wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyUpdate {
    pub max_burn_rate_per_hour: Option<f64>,
    pub blocked_intents: Option<Vec<IntentCategory>>,
    pub pii_masking_enabled: Option<bool>,
    pub shadow_mode: Option<bool>,
    pub block_pii: Option<bool>,
    pub block_destructive: Option<bool>,
    pub block_external_calls: Option<bool>,
    pub allowed_models: Option<Vec<String>>,
    pub max_tokens_per_request: Option<Option<u64>>,
}

impl PolicyUpdate {
    /// Merge this update onto `base`, bumping the version.
    pub fn apply(&self, base: &PolicyDocument) -> PolicyDocument {
        let mut next = base.clone();
        next.version = base.version + 1;
        if let Some(v) = self.max_burn_rate_per_hour {
            next.max_burn_rate_per_hour = v;
        }
        if let Some(ref v) = self.blocked_intents {
            next.blocked_intents = v.clone();
        }
        if let Some(v) = self.pii_masking_enabled {
            next.pii_masking_enabled = v;
        }
        if let Some(v) = self.shadow_mode {
            next.shadow_mode = v;
        }
        if let Some(v) = self.block_pii {
            next.rules.block_pii = v;
        }
        if let Some(v) = self.block_destructive {
            next.rules.block_destructive = v;
        }
        if let Some(v) = self.block_external_calls {
            next.rules.block_external_calls = v;
        }
        if let Some(ref v) = self.allowed_models {
            next.rules.allowed_models = v.clone();
        }
        if let Some(v) = self.max_tokens_per_request {
            next.rules.max_tokens_per_request = v;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_roundtrip_with_defaults() {
        let yaml = r#"
policy_id: prod
blocked_intents: [destructive]
shadow_mode: true
rules:
  allowed_models: ["gpt-3.5-turbo", "gpt-4"]
"#;
        let doc: PolicyDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.policy_id, "prod");
        assert!(doc.shadow_mode);
        assert!(doc.blocks_intent(IntentCategory::Destructive));
        assert!(!doc.blocks_intent(IntentCategory::DataAccess));
        assert!(doc.rules.block_pii); // default survives partial rules
        assert!(doc.allows_model("gpt-4"));
        assert!(!doc.allows_model("o1-preview"));
    }

    #[test]
    fn test_empty_allowlist_admits_all() {
        let doc = PolicyDocument::default();
        assert!(doc.allows_model("anything"));
    }

    #[test]
    fn test_partial_update_bumps_version() {
        let base = PolicyDocument::default();
        let update = PolicyUpdate {
            shadow_mode: Some(true),
            blocked_intents: Some(vec![IntentCategory::CodeExecution]),
            ..Default::default()
        };
        let next = update.apply(&base);
        assert_eq!(next.version, base.version + 1);
        assert!(next.shadow_mode);
        assert!(next.blocks_intent(IntentCategory::CodeExecution));
        // Untouched fields carry over.
        assert_eq!(next.max_burn_rate_per_hour, base.max_burn_rate_per_hour);
        assert_eq!(next.rules.block_pii, base.rules.block_pii);
    }
}
