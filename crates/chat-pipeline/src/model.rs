//! Model invocation capability.
//!
//! The engine treats text generation as an opaque capability: implementations
//! shape the transport (HTTP, SSE, local process) and the provider; the
//! pipeline only consumes [`ModelInvoker`]. Streaming providers implement
//! [`ModelInvoker::stream`]; single-shot providers get a conforming stream
//! for free from the default implementation.

use crate::state::Message;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A generation request handed to the model backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// System prompt assembled by the context stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversation history, oldest first.
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    Stop,
    /// Output budget exhausted.
    Length,
    /// Provider-specific reason, carried verbatim.
    Other(String),
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// One element of a streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// An incremental text fragment.
    Delta(String),
    /// The terminal event carrying the assembled response.
    Done(ModelResponse),
}

/// Errors surfaced by model backends.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The backend rejected or failed the invocation.
    #[error("model invocation failed: {0}")]
    Invocation(String),

    /// The backend throttled the caller.
    #[error("model rate limited{}", retry_after.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    /// The invocation was cancelled before completing.
    #[error("model invocation cancelled")]
    Cancelled,
}

/// Opaque text-generation capability.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Runs a single-shot generation.
    ///
    /// Implementations should observe `cancel` and return promptly (with
    /// [`ModelError::Cancelled`]) once it fires.
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError>;

    /// Runs a streaming generation: a sequence of text deltas followed by a
    /// terminal [`StreamChunk::Done`].
    ///
    /// The default implementation degrades to [`generate`](Self::generate)
    /// and emits the whole response as one delta.
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<StreamChunk, ModelError>>, ModelError> {
        let response = self.generate(request, cancel).await?;
        let chunks = vec![
            Ok(StreamChunk::Delta(response.text.clone())),
            Ok(StreamChunk::Done(response)),
        ];
        Ok(futures::stream::iter(chunks).boxed())
    }
}
