//! LLM intent tier - semantic layer-2 classification.
//!
//! [`LlmIntentTier`] is the capability the hybrid resolver consults when
//! keyword confidence is low. Two transports conform:
//!
//! - [`StructuredIntentClassifier`]: the model returns a JSON object
//!   matching `{ intent, confidence, reasoning? }`.
//! - [`TextIntentClassifier`]: the model returns free-form text with
//!   labelled `INTENT:` / `CONFIDENCE:` / `REASONING:` lines.
//!
//! Both validate the returned intent against the configured categories,
//! coerce unknown intents to `general`, and clamp confidence into `[0, 1]`.

use crate::intent::keyword::GENERAL_INTENT;
use crate::model::{GenerationRequest, ModelError, ModelInvoker, TokenUsage};
use crate::state::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors surfaced by the LLM tier.
///
/// These never fail a plan: the hybrid resolver degrades to `general`.
#[derive(Debug, Error)]
pub enum IntentError {
    /// The underlying model invocation failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The model answered but the output could not be interpreted.
    #[error("unparseable classifier output: {0}")]
    Parse(String),
}

/// What the LLM tier concluded about a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmIntentOutcome {
    /// One of the configured categories, or `general`.
    pub intent: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Semantic classification capability.
#[async_trait]
pub trait LlmIntentTier: Send + Sync {
    async fn classify(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmIntentOutcome, IntentError>;
}

fn coerce_intent(raw: &str, categories: &[String]) -> String {
    let lowered = raw.trim().to_lowercase();
    if lowered == GENERAL_INTENT || categories.iter().any(|category| *category == lowered) {
        lowered
    } else {
        debug!(intent = %lowered, "intent outside configured categories, coercing to general");
        GENERAL_INTENT.to_string()
    }
}

fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 }
}

/// Pulls a JSON object out of a model answer that may wrap it in markdown
/// fences or surrounding prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(fenced) = trimmed
        .split_once("```json")
        .or_else(|| trimmed.split_once("```"))
        .and_then(|(_, rest)| rest.split_once("```"))
        .map(|(body, _)| body.trim())
    {
        if fenced.starts_with('{') {
            return Some(fenced);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[derive(Debug, Deserialize)]
struct StructuredResponse {
    intent: String,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

/// JSON-transport classifier over any [`ModelInvoker`].
pub struct StructuredIntentClassifier<M> {
    invoker: M,
    categories: Vec<String>,
    prompt_template: Option<String>,
}

impl<M: ModelInvoker> StructuredIntentClassifier<M> {
    pub fn new(invoker: M, categories: Vec<String>) -> Self {
        Self {
            invoker,
            categories,
            prompt_template: None,
        }
    }

    /// Overrides the classification prompt. Use `{categories}` and
    /// `{message}` placeholders.
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    fn render_prompt(&self, message: &str) -> String {
        let template = self.prompt_template.as_deref().unwrap_or(
            r#"Classify the user message into exactly one intent category.

Categories: {categories} (answer "general" if none fits)

Respond with a JSON object only:
{"intent": "<category>", "confidence": <0.0-1.0>, "reasoning": "<one sentence>"}

User message: {message}"#,
        );
        template
            .replace("{categories}", &self.categories.join(", "))
            .replace("{message}", message)
    }
}

#[async_trait]
impl<M: ModelInvoker> LlmIntentTier for StructuredIntentClassifier<M> {
    async fn classify(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmIntentOutcome, IntentError> {
        let request = GenerationRequest::new(vec![Message::user(self.render_prompt(message))]);
        let response = self.invoker.generate(request, cancel).await?;

        let json = extract_json_object(&response.text)
            .ok_or_else(|| IntentError::Parse("no JSON object in model output".to_string()))?;
        let parsed: StructuredResponse = serde_json::from_str(json)
            .map_err(|error| IntentError::Parse(error.to_string()))?;

        Ok(LlmIntentOutcome {
            intent: coerce_intent(&parsed.intent, &self.categories),
            confidence: clamp_confidence(parsed.confidence),
            reasoning: parsed.reasoning,
            usage: Some(response.usage),
        })
    }
}

/// Labelled-lines transport classifier over any [`ModelInvoker`].
///
/// Parsing is deliberately forgiving: field labels are case-insensitive,
/// surrounding whitespace is ignored, a missing intent falls back to
/// `general`, and an unparseable confidence defaults to 0.5. This
/// classifier never fails on output shape.
pub struct TextIntentClassifier<M> {
    invoker: M,
    categories: Vec<String>,
    prompt_template: Option<String>,
}

impl<M: ModelInvoker> TextIntentClassifier<M> {
    pub fn new(invoker: M, categories: Vec<String>) -> Self {
        Self {
            invoker,
            categories,
            prompt_template: None,
        }
    }

    /// Overrides the classification prompt. Use `{categories}` and
    /// `{message}` placeholders.
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    fn render_prompt(&self, message: &str) -> String {
        let template = self.prompt_template.as_deref().unwrap_or(
            r#"Classify the user message into exactly one intent category.

Categories: {categories} (answer "general" if none fits)

Respond with exactly three lines:
INTENT: <category>
CONFIDENCE: <0.0-1.0>
REASONING: <one sentence>

User message: {message}"#,
        );
        template
            .replace("{categories}", &self.categories.join(", "))
            .replace("{message}", message)
    }

    fn parse(&self, text: &str) -> LlmIntentOutcome {
        let mut intent: Option<String> = None;
        let mut confidence: Option<f64> = None;
        let mut reasoning: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(value) = labelled_value(line, "intent") {
                intent = Some(value.to_string());
            } else if let Some(value) = labelled_value(line, "confidence") {
                confidence = value.parse::<f64>().ok();
            } else if let Some(value) = labelled_value(line, "reasoning") {
                reasoning = Some(value.to_string());
            }
        }

        LlmIntentOutcome {
            intent: intent
                .map(|raw| coerce_intent(&raw, &self.categories))
                .unwrap_or_else(|| GENERAL_INTENT.to_string()),
            confidence: confidence.map(clamp_confidence).unwrap_or(0.5),
            reasoning,
            usage: None,
        }
    }
}

/// Extracts `value` from a `LABEL: value` line, case-insensitively.
fn labelled_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let (head, tail) = line.split_once(':')?;
    head.trim()
        .eq_ignore_ascii_case(label)
        .then(|| tail.trim())
}

#[async_trait]
impl<M: ModelInvoker> LlmIntentTier for TextIntentClassifier<M> {
    async fn classify(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmIntentOutcome, IntentError> {
        let request = GenerationRequest::new(vec![Message::user(self.render_prompt(message))]);
        let response = self.invoker.generate(request, cancel).await?;
        let mut outcome = self.parse(&response.text);
        outcome.usage = Some(response.usage);
        Ok(outcome)
    }
}
