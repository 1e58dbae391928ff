//! Hybrid intent resolver - keyword tier first, LLM tier below threshold.
//!
//! The resolver always runs the keyword classifier. When its confidence is
//! at or above the threshold (or no LLM tier is configured, or the fallback
//! is disabled), the keyword result stands. Otherwise the LLM tier decides,
//! and metadata is looked up fresh for the LLM-chosen intent so tone and
//! deep links match the intent that actually won. An LLM failure degrades
//! to the `general` intent; the plan never fails because the fallback tier
//! did.

use crate::intent::keyword::{
    ClassificationMethod, IntentResult, KeywordClassifier,
};
use crate::intent::llm::LlmIntentTier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default keyword-confidence threshold below which the LLM tier runs.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Observability payload describing one LLM fallback, emitted on every
/// fallback regardless of whether the tiers agreed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentFallback {
    pub message: String,
    pub keyword_intent: String,
    pub keyword_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_reasoning: Option<String>,
}

/// A classification plus the fallback report, when the LLM tier ran.
#[derive(Debug, Clone)]
pub struct ClassifiedIntent {
    pub result: IntentResult,
    pub fallback: Option<IntentFallback>,
}

/// Two-tier intent resolver.
pub struct HybridIntentResolver {
    keyword: KeywordClassifier,
    llm: Option<Arc<dyn LlmIntentTier>>,
    threshold: f64,
    llm_fallback_enabled: bool,
}

impl HybridIntentResolver {
    /// Creates a keyword-only resolver.
    pub fn new(keyword: KeywordClassifier) -> Self {
        Self {
            keyword,
            llm: None,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            llm_fallback_enabled: true,
        }
    }

    /// Installs the LLM tier consulted below the confidence threshold.
    pub fn with_llm_tier(mut self, tier: Arc<dyn LlmIntentTier>) -> Self {
        self.llm = Some(tier);
        self
    }

    /// Overrides the confidence threshold (default 0.5). Keyword results at
    /// or above the threshold bypass the LLM tier.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Enables or disables the LLM fallback without removing the tier.
    pub fn with_llm_fallback(mut self, enabled: bool) -> Self {
        self.llm_fallback_enabled = enabled;
        self
    }

    /// The underlying keyword classifier (metadata lookups, categories).
    pub fn keyword_classifier(&self) -> &KeywordClassifier {
        &self.keyword
    }

    /// Classifies a message, returning only the result.
    pub async fn classify(&self, message: &str, cancel: &CancellationToken) -> IntentResult {
        self.classify_with_report(message, cancel).await.result
    }

    /// Classifies a message and reports whether the LLM tier was consulted.
    pub async fn classify_with_report(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> ClassifiedIntent {
        let keyword = self.keyword.classify(message);

        let tier = match &self.llm {
            Some(tier) if self.llm_fallback_enabled && keyword.confidence < self.threshold => tier,
            _ => {
                return ClassifiedIntent {
                    result: keyword,
                    fallback: None,
                };
            }
        };

        debug!(
            keyword_intent = %keyword.intent,
            keyword_confidence = keyword.confidence,
            threshold = self.threshold,
            "keyword confidence below threshold, consulting LLM tier"
        );

        match tier.classify(message, cancel).await {
            Ok(outcome) => {
                let fallback = IntentFallback {
                    message: message.to_string(),
                    keyword_intent: keyword.intent.clone(),
                    keyword_confidence: keyword.confidence,
                    llm_intent: Some(outcome.intent.clone()),
                    llm_confidence: Some(outcome.confidence),
                    llm_reasoning: outcome.reasoning.clone(),
                };
                // Metadata follows the winning intent, not the keyword guess.
                let metadata = self.keyword.metadata_for(&outcome.intent).cloned();
                ClassifiedIntent {
                    result: IntentResult {
                        intent: outcome.intent,
                        confidence: outcome.confidence,
                        matched_keywords: Vec::new(),
                        method: ClassificationMethod::Llm,
                        metadata,
                        reasoning: outcome.reasoning,
                    },
                    fallback: Some(fallback),
                }
            }
            Err(error) => {
                warn!(%error, "LLM intent tier failed, degrading to general");
                ClassifiedIntent {
                    result: IntentResult::general(),
                    fallback: Some(IntentFallback {
                        message: message.to_string(),
                        keyword_intent: keyword.intent,
                        keyword_confidence: keyword.confidence,
                        llm_intent: None,
                        llm_confidence: None,
                        llm_reasoning: None,
                    }),
                }
            }
        }
    }
}
