//! Generation stage.
//!
//! Hands the conversation and the assembled system prompt to a
//! [`ModelInvoker`] and publishes the response under the `ai_response` key.
//! Invoker faults propagate as stage faults and become generic 500 failures
//! at the executor boundary.

use crate::executor::{Stage, StageContext, StageError, StageHandler};
use crate::model::{GenerationRequest, ModelInvoker};
use crate::state::{ExtensionValue, PipelineState, keys};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Canonical stage name.
pub const STAGE_NAME: &str = "generation";

/// Invokes the model over the accumulated state.
pub struct GenerationStage {
    invoker: Arc<dyn ModelInvoker>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl GenerationStage {
    pub fn new(invoker: Arc<dyn ModelInvoker>) -> Self {
        Self {
            invoker,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Wraps the stage under its canonical name.
    pub fn into_stage(self) -> Stage {
        Stage::new(STAGE_NAME, self)
    }
}

#[async_trait]
impl StageHandler for GenerationStage {
    async fn handle(
        &self,
        state: PipelineState,
        ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        let request = GenerationRequest {
            system: state
                .prompt_context()
                .map(|selection| selection.system_prompt.clone()),
            messages: state.request.messages.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self.invoker.generate(request, &ctx.cancellation).await?;
        debug!(
            finish_reason = ?response.finish_reason,
            output_tokens = response.usage.output_tokens,
            "generation complete"
        );
        Ok(state.with_extension(keys::AI_RESPONSE, ExtensionValue::Response(response)))
    }
}
