//! Two-tier intent classification.
//!
//! Layer 1 is the deterministic [`KeywordClassifier`]: fast substring
//! scoring with a margin-based confidence. Layer 2 is an [`LlmIntentTier`]
//! capability consulted by the [`HybridIntentResolver`] when keyword
//! confidence falls below its threshold. The LLM tier is best-effort by
//! contract: its failure degrades to the `general` intent and never fails
//! the plan.

pub mod hybrid;
pub mod keyword;
pub mod llm;

pub use hybrid::{ClassifiedIntent, HybridIntentResolver, IntentFallback};
pub use keyword::{
    ClassificationMethod, GENERAL_INTENT, IntentMetadata, IntentPattern, IntentResult,
    KeywordClassifier,
};
pub use llm::{
    IntentError, LlmIntentOutcome, LlmIntentTier, StructuredIntentClassifier, TextIntentClassifier,
};
