//! Keyword intent classifier - fast, deterministic layer-1 classification.
//!
//! Scores a message against configured keyword patterns by case-insensitive
//! substring containment. Multi-word keywords intentionally score higher
//! than single-word ones (a match adds the keyword's word count). Confidence
//! is a margin ratio between the best and second-best category.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The distinguished fallback intent.
pub const GENERAL_INTENT: &str = "general";

/// A category and the keywords that vote for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentPattern {
    pub category: String,
    /// Stored lowercased; matching is case-insensitive.
    pub keywords: Vec<String>,
}

impl IntentPattern {
    pub fn new<I, S>(category: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            category: category.into(),
            keywords: keywords
                .into_iter()
                .map(|keyword| keyword.into().to_lowercase())
                .collect(),
        }
    }
}

/// Presentation metadata attached to a classified intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMetadata {
    /// Tone directive consumed by the context stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    /// Client navigation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_link: Option<String>,
    /// Whether acting on this intent requires an identified caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_auth: Option<bool>,
}

impl IntentMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }

    pub fn with_deep_link(mut self, deep_link: impl Into<String>) -> Self {
        self.deep_link = Some(deep_link.into());
        self
    }

    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = Some(requires_auth);
        self
    }
}

/// Which tier produced an [`IntentResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Keyword,
    Llm,
}

/// A classified intent with its confidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: String,
    /// In `[0, 1]`. For the keyword tier this is the margin ratio
    /// `(best - second) / max(best, 1)`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_keywords: Vec<String>,
    pub method: ClassificationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<IntentMetadata>,
    /// LLM-tier explanation, when that tier decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl IntentResult {
    /// The safe default: no signal, `general` at zero confidence.
    pub fn general() -> Self {
        Self {
            intent: GENERAL_INTENT.to_string(),
            confidence: 0.0,
            matched_keywords: Vec::new(),
            method: ClassificationMethod::Keyword,
            metadata: None,
            reasoning: None,
        }
    }
}

/// Layer-1 classifier over keyword patterns.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    patterns: Vec<IntentPattern>,
    metadata: HashMap<String, IntentMetadata>,
}

impl KeywordClassifier {
    pub fn new(patterns: Vec<IntentPattern>) -> Self {
        Self {
            patterns,
            metadata: HashMap::new(),
        }
    }

    /// Replaces the per-category metadata table.
    pub fn with_metadata(mut self, metadata: HashMap<String, IntentMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds metadata for one category.
    pub fn with_category_metadata(
        mut self,
        category: impl Into<String>,
        metadata: IntentMetadata,
    ) -> Self {
        self.metadata.insert(category.into(), metadata);
        self
    }

    /// The configured category names, in pattern order.
    pub fn categories(&self) -> Vec<String> {
        self.patterns
            .iter()
            .map(|pattern| pattern.category.clone())
            .collect()
    }

    /// Metadata for a category, without running classification.
    pub fn metadata_for(&self, category: &str) -> Option<&IntentMetadata> {
        self.metadata.get(category)
    }

    /// Classifies a message.
    ///
    /// Each keyword contained in the lowercased message adds its word count
    /// to the owning category. Confidence is the margin ratio between the
    /// two best categories: a unique winner against silence scores 1.0, a
    /// tie scores 0.
    pub fn classify(&self, message: &str) -> IntentResult {
        let lower = message.to_lowercase();

        let mut scored: Vec<(&IntentPattern, usize, Vec<String>)> = self
            .patterns
            .iter()
            .map(|pattern| {
                let mut score = 0usize;
                let mut matched = Vec::new();
                for keyword in &pattern.keywords {
                    if lower.contains(keyword.as_str()) {
                        score += keyword.split_whitespace().count();
                        matched.push(keyword.clone());
                    }
                }
                (pattern, score, matched)
            })
            .collect();

        // Stable sort: ties keep configuration order.
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let Some((winner, best, matched)) = scored.first().cloned() else {
            return IntentResult::general();
        };
        if best == 0 {
            return IntentResult::general();
        }

        let second = scored.get(1).map(|entry| entry.1).unwrap_or(0);
        let confidence = ((best - second) as f64 / best.max(1) as f64).min(1.0);

        IntentResult {
            intent: winner.category.clone(),
            confidence,
            matched_keywords: matched,
            method: ClassificationMethod::Keyword,
            metadata: self.metadata.get(&winner.category).cloned(),
            reasoning: None,
        }
    }
}
