//! Integration tests for hybrid intent resolution inside a plan.

use async_trait::async_trait;
use chat_pipeline::executor::{ExecutorConfig, ExecutorHooks, PipelineExecutor, Plan};
use chat_pipeline::intent::{
    ClassificationMethod, HybridIntentResolver, IntentError, IntentMetadata, IntentPattern,
    KeywordClassifier, LlmIntentOutcome, LlmIntentTier, TextIntentClassifier,
};
use chat_pipeline::model::{
    FinishReason, GenerationRequest, ModelError, ModelInvoker, ModelResponse, TokenUsage,
};
use chat_pipeline::stages::IntentStage;
use chat_pipeline::state::{ChatRequest, Message, PipelineState};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn classifier_with_metadata() -> KeywordClassifier {
    KeywordClassifier::new(vec![
        IntentPattern::new("greeting", ["hello", "hi"]),
        IntentPattern::new("question", ["how", "what", "why"]),
    ])
    .with_category_metadata(
        "question",
        IntentMetadata::new()
            .with_tone("Be informative and thorough")
            .with_deep_link("/faq"),
    )
}

struct StubTier {
    intent: &'static str,
    confidence: f64,
}

#[async_trait]
impl LlmIntentTier for StubTier {
    async fn classify(
        &self,
        _message: &str,
        _cancel: &CancellationToken,
    ) -> Result<LlmIntentOutcome, IntentError> {
        Ok(LlmIntentOutcome {
            intent: self.intent.to_string(),
            confidence: self.confidence,
            reasoning: Some("math expression reads as a question".to_string()),
            usage: None,
        })
    }
}

struct FailingTier;

#[async_trait]
impl LlmIntentTier for FailingTier {
    async fn classify(
        &self,
        _message: &str,
        _cancel: &CancellationToken,
    ) -> Result<LlmIntentOutcome, IntentError> {
        Err(IntentError::Model(ModelError::Invocation(
            "llm timeout".to_string(),
        )))
    }
}

fn plan_with_resolver(resolver: HybridIntentResolver) -> Plan {
    Plan::builder()
        .stage(IntentStage::new(Arc::new(resolver)).into_stage())
        .build()
        .unwrap()
}

fn state(text: &str) -> PipelineState {
    PipelineState::new(ChatRequest::new(vec![Message::user(text)]))
}

#[tokio::test]
async fn test_fallback_uses_llm_intents_metadata() {
    // Keyword patterns do not cover math expressions; the stub LLM resolves
    // them as questions. The result must carry the *question* metadata, not
    // whatever the keyword tier would have attached.
    let resolver = HybridIntentResolver::new(classifier_with_metadata()).with_llm_tier(Arc::new(
        StubTier {
            intent: "question",
            confidence: 0.9,
        },
    ));

    let fallbacks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fallbacks);
    let config = ExecutorConfig::new().with_hooks(ExecutorHooks::new().on_intent_fallback(
        move |fallback| {
            sink.lock().unwrap().push(fallback.clone());
        },
    ));

    let outcome = PipelineExecutor::new(config)
        .execute(state("23 + 44"), &plan_with_resolver(resolver))
        .await;

    assert!(outcome.ok);
    let intent = outcome.state.intent().unwrap();
    assert_eq!(intent.intent, "question");
    assert_eq!(intent.confidence, 0.9);
    assert_eq!(intent.method, ClassificationMethod::Llm);
    let metadata = intent.metadata.as_ref().unwrap();
    assert_eq!(metadata.tone.as_deref(), Some("Be informative and thorough"));
    assert_eq!(metadata.deep_link.as_deref(), Some("/faq"));

    let fallbacks = fallbacks.lock().unwrap();
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].keyword_intent, "general");
    assert_eq!(fallbacks[0].llm_intent.as_deref(), Some("question"));
}

#[tokio::test]
async fn test_llm_tier_failure_never_fails_the_plan() {
    let resolver =
        HybridIntentResolver::new(classifier_with_metadata()).with_llm_tier(Arc::new(FailingTier));

    let fallbacks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fallbacks);
    let config = ExecutorConfig::new().with_hooks(ExecutorHooks::new().on_intent_fallback(
        move |fallback| {
            sink.lock().unwrap().push(fallback.clone());
        },
    ));

    let outcome = PipelineExecutor::new(config)
        .execute(state("23 + 44"), &plan_with_resolver(resolver))
        .await;

    assert!(outcome.ok);
    let intent = outcome.state.intent().unwrap();
    assert_eq!(intent.intent, "general");
    assert_eq!(intent.confidence, 0.0);
    // The attempt is still observable.
    assert_eq!(fallbacks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_confident_keyword_result_skips_llm_and_hook() {
    let resolver = HybridIntentResolver::new(classifier_with_metadata()).with_llm_tier(Arc::new(
        StubTier {
            intent: "question",
            confidence: 0.9,
        },
    ));

    let fallbacks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fallbacks);
    let config = ExecutorConfig::new().with_hooks(ExecutorHooks::new().on_intent_fallback(
        move |fallback| {
            sink.lock().unwrap().push(fallback.clone());
        },
    ));

    let outcome = PipelineExecutor::new(config)
        .execute(state("Hello there"), &plan_with_resolver(resolver))
        .await;

    assert!(outcome.ok);
    let intent = outcome.state.intent().unwrap();
    assert_eq!(intent.intent, "greeting");
    assert_eq!(intent.confidence, 1.0);
    assert_eq!(intent.method, ClassificationMethod::Keyword);
    assert_eq!(intent.matched_keywords, vec!["hello"]);
    assert!(fallbacks.lock().unwrap().is_empty());
}

/// A textual-transport LLM tier wired through a canned model backend.
struct CannedModel {
    text: &'static str,
}

#[async_trait]
impl ModelInvoker for CannedModel {
    async fn generate(
        &self,
        _request: GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        Ok(ModelResponse {
            text: self.text.to_string(),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
        })
    }
}

#[tokio::test]
async fn test_textual_tier_end_to_end() {
    let classifier = classifier_with_metadata();
    let tier = TextIntentClassifier::new(
        CannedModel {
            text: "INTENT: question\nCONFIDENCE: 0.8\nREASONING: asks for a computation",
        },
        classifier.categories(),
    );
    let resolver = HybridIntentResolver::new(classifier).with_llm_tier(Arc::new(tier));

    let outcome = PipelineExecutor::default()
        .execute(state("23 + 44"), &plan_with_resolver(resolver))
        .await;

    assert!(outcome.ok);
    let intent = outcome.state.intent().unwrap();
    assert_eq!(intent.intent, "question");
    assert_eq!(intent.confidence, 0.8);
    assert_eq!(
        intent.reasoning.as_deref(),
        Some("asks for a computation")
    );
    assert_eq!(intent.metadata.as_ref().unwrap().deep_link.as_deref(), Some("/faq"));
}
