//! Keyword-weight intent classification.
//!
//! The body is tokenised once, lowercased; each category scores the sum of
//! its matched keywords times its weight, unique per keyword. The winner
//! is the category with the maximum score.

use std::collections::HashSet;

use crate::types::IntentCategory;

/// Outcome of intent classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentScore {
    pub category: IntentCategory,
    /// `min(0.95, max_score / 5)`; 0 for empty input.
    pub confidence: f64,
    pub raw_score: f64,
}

/// Classify a serialised body. Empty input yields `unknown` at zero
/// confidence.
pub fn classify(text: &str) -> IntentScore {
    let tokens: HashSet<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '+')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    if tokens.is_empty() {
        return IntentScore {
            category: IntentCategory::Unknown,
            confidence: 0.0,
            raw_score: 0.0,
        };
    }

    let mut best = IntentScore {
        category: IntentCategory::Unknown,
        confidence: 0.0,
        raw_score: 0.0,
    };
    for category in IntentCategory::all() {
        let matched = category
            .keywords()
            .iter()
            .filter(|k| tokens.contains(**k))
            .count();
        let score = matched as f64 * category.weight();
        if score > best.raw_score {
            best = IntentScore {
                category: *category,
                confidence: 0.0,
                raw_score: score,
            };
        }
    }

    if best.raw_score > 0.0 {
        best.confidence = (best.raw_score / 5.0).min(0.95);
    } else {
        best.category = IntentCategory::Unknown;
    }
    best
}
