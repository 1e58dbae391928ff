//! Intent classification stage.
//!
//! Wraps a [`HybridIntentResolver`] and publishes the classified intent
//! under the `intent` extension key. When the LLM tier was consulted, the
//! fallback report is surfaced through `on_intent_fallback`.

use crate::executor::{Stage, StageContext, StageError, StageHandler};
use crate::intent::{HybridIntentResolver, IntentResult};
use crate::state::{ExtensionValue, PipelineState, keys};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Canonical stage name.
pub const STAGE_NAME: &str = "intent";

/// Classifies the last user message.
pub struct IntentStage {
    resolver: Arc<HybridIntentResolver>,
}

impl IntentStage {
    pub fn new(resolver: Arc<HybridIntentResolver>) -> Self {
        Self { resolver }
    }

    /// Wraps the stage under its canonical name.
    pub fn into_stage(self) -> Stage {
        Stage::new(STAGE_NAME, self)
    }
}

#[async_trait]
impl StageHandler for IntentStage {
    async fn handle(
        &self,
        state: PipelineState,
        ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        let Some(text) = state.last_user_message().map(|message| message.text()) else {
            debug!("no user message to classify");
            return Ok(state
                .with_extension(keys::INTENT, ExtensionValue::Intent(IntentResult::general())));
        };

        let classified = self
            .resolver
            .classify_with_report(&text, &ctx.cancellation)
            .await;
        if let Some(fallback) = &classified.fallback {
            ctx.hooks.intent_fallback(fallback);
        }

        debug!(
            intent = %classified.result.intent,
            confidence = classified.result.confidence,
            method = ?classified.result.method,
            "intent classified"
        );
        Ok(state.with_extension(keys::INTENT, ExtensionValue::Intent(classified.result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{IntentPattern, KeywordClassifier};
    use crate::state::{ChatRequest, Message};

    fn stage() -> IntentStage {
        let classifier =
            KeywordClassifier::new(vec![IntentPattern::new("greeting", ["hello", "hi"])]);
        IntentStage::new(Arc::new(HybridIntentResolver::new(classifier)))
    }

    #[tokio::test]
    async fn test_writes_intent_extension() {
        let state = PipelineState::new(ChatRequest::new(vec![Message::user("hello")]));
        let result = stage()
            .handle(state, StageContext::detached())
            .await
            .unwrap();

        assert_eq!(result.intent().unwrap().intent, "greeting");
    }

    #[tokio::test]
    async fn test_no_user_message_yields_general() {
        let state = PipelineState::new(ChatRequest::new(vec![Message::system("rules")]));
        let result = stage()
            .handle(state, StageContext::detached())
            .await
            .unwrap();

        assert_eq!(result.intent().unwrap().intent, "general");
    }
}
