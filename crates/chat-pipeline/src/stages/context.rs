//! Prompt-context stages.
//!
//! [`StaticContextStage`] selects from a fixed catalog via
//! [`ContextOptimizer`]; [`DynamicContextStage`] builds context through a
//! [`DynamicContextEngine`] and its externally loaded, variant-keyed
//! catalogs. Both publish the selection under the `prompt_context` key.

use crate::context::{
    ContextExtractors, ContextOptimizer, DynamicContextEngine, SelectionRequest, VariantUsed,
};
use crate::executor::{Stage, StageContext, StageError, StageHandler};
use crate::state::{ExtensionValue, Failure, PipelineState, keys};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Canonical name of the static context stage.
pub const STATIC_STAGE_NAME: &str = "prompt_context";

/// Canonical name of the dynamic context stage; also the `step` recorded on
/// its failures.
pub const DYNAMIC_STAGE_NAME: &str = "dynamic_context";

/// Selects prompt context from a static catalog.
pub struct StaticContextStage {
    optimizer: Arc<ContextOptimizer>,
    extractors: ContextExtractors,
}

impl StaticContextStage {
    pub fn new(optimizer: Arc<ContextOptimizer>) -> Self {
        Self {
            optimizer,
            extractors: ContextExtractors::default(),
        }
    }

    /// Overrides how topics and tone derive from state.
    pub fn with_extractors(mut self, extractors: ContextExtractors) -> Self {
        self.extractors = extractors;
        self
    }

    /// Wraps the stage under its canonical name.
    pub fn into_stage(self) -> Stage {
        Stage::new(STATIC_STAGE_NAME, self)
    }
}

#[async_trait]
impl StageHandler for StaticContextStage {
    async fn handle(
        &self,
        state: PipelineState,
        _ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        let request = SelectionRequest {
            topics: (self.extractors.topics)(&state),
            is_first_message: state.is_first_message(),
            tone: (self.extractors.tone)(&state),
        };
        let selection = self.optimizer.optimize(&request);
        Ok(state.with_extension(keys::PROMPT_CONTEXT, ExtensionValue::Context(selection)))
    }
}

/// Builds prompt context from externally loaded catalogs.
pub struct DynamicContextStage {
    engine: Arc<DynamicContextEngine>,
}

impl DynamicContextStage {
    pub fn new(engine: Arc<DynamicContextEngine>) -> Self {
        Self { engine }
    }

    /// Wraps the stage under its canonical name.
    pub fn into_stage(self) -> Stage {
        Stage::new(DYNAMIC_STAGE_NAME, self)
    }
}

#[async_trait]
impl StageHandler for DynamicContextStage {
    async fn handle(
        &self,
        state: PipelineState,
        ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        if let Some(variant) = self.engine.variant_for(&state) {
            ctx.hooks.variant_used(&VariantUsed { variant });
        }

        match self.engine.build(&state, &ctx.cancellation).await {
            Ok(selection) => {
                Ok(state.with_extension(keys::PROMPT_CONTEXT, ExtensionValue::Context(selection)))
            }
            Err(error) => {
                // Loader failure without a fallback catalog: surface as a
                // failure descriptor, not a fault.
                warn!(%error, "dynamic context build failed");
                let failure = Failure::internal()
                    .with_step(DYNAMIC_STAGE_NAME)
                    .with_details(error.to_string());
                Ok(state.fail(failure))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextLoadError, ContextLoader, ContextPolicy, ContextSection, LoaderQuery};
    use crate::state::{ChatRequest, Message};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn state() -> PipelineState {
        PipelineState::new(ChatRequest::new(vec![Message::user("hello")]))
    }

    #[tokio::test]
    async fn test_static_stage_writes_selection() {
        let optimizer = ContextOptimizer::new(vec![
            ContextSection::new("core", "A").always_include(),
        ])
        .with_policy(ContextPolicy::selective());
        let stage = StaticContextStage::new(Arc::new(optimizer));

        let result = stage.handle(state(), StageContext::detached()).await.unwrap();

        assert_eq!(result.prompt_context().unwrap().system_prompt, "A");
    }

    #[tokio::test]
    async fn test_dynamic_stage_failure_becomes_descriptor() {
        struct FailingLoader;

        #[async_trait]
        impl ContextLoader for FailingLoader {
            async fn load(
                &self,
                _query: &LoaderQuery,
                _cancel: &CancellationToken,
            ) -> Result<Vec<ContextSection>, ContextLoadError> {
                Err(ContextLoadError::Backend("down".to_string()))
            }
        }

        let engine = DynamicContextEngine::new(Arc::new(FailingLoader), Duration::from_secs(60));
        let stage = DynamicContextStage::new(Arc::new(engine));

        let result = stage.handle(state(), StageContext::detached()).await.unwrap();

        let failure = result.failure.unwrap();
        assert_eq!(failure.status_code, 500);
        assert_eq!(failure.step.as_deref(), Some(DYNAMIC_STAGE_NAME));
    }
}
