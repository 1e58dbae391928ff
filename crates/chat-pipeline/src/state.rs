//! Per-request state threaded through a pipeline execution.
//!
//! A [`PipelineState`] carries the incoming [`ChatRequest`], an optional
//! [`Failure`] descriptor, and an open extension map. Stages never mutate a
//! state in place: each stage consumes the previous record and publishes a
//! new one (copy-on-write by supersession). A state record lives for exactly
//! one plan execution.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::context::ContextSelection;
use crate::intent::IntentResult;
use crate::model::ModelResponse;
use crate::stages::{ModerationVerdict, RateLimitStatus};

/// Well-known extension keys used by the bundled stages.
///
/// The extension namespace is open; these are only the conventional slots.
pub mod keys {
    /// Moderation verdict written by the content-moderation stage.
    pub const CONTENT_MODERATION: &str = "content_moderation";
    /// Rate-limit status written by the rate-limit stage.
    pub const RATE_LIMIT: &str = "rate_limit";
    /// Classified intent written by the intent stage.
    pub const INTENT: &str = "intent";
    /// Prompt context selection written by the context stages.
    pub const PROMPT_CONTEXT: &str = "prompt_context";
    /// Model response written by the generation stage.
    pub const AI_RESPONSE: &str = "ai_response";
}

/// Speaker role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One part of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// A typed, non-text part (image reference, tool payload, ...). The
    /// engine carries it opaquely.
    Data { kind: String, payload: JsonValue },
}

/// Message body: either a plain string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Returns the concatenated text content, ignoring non-text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Data { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// A single conversation message. Immutable within a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// Creates a message with the given role and plain-text content.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Creates a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Creates an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Creates a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Returns the text content of this message.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// The incoming request: an ordered conversation plus caller metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,
}

impl ChatRequest {
    /// Creates a request from an ordered message sequence.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            metadata: HashMap::new(),
        }
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Failure descriptor attached to a state when a stage rejects the request.
///
/// Presence of a failure is terminal for the plan: the executor stops and
/// surfaces it. The `message` is a stable, generic string safe for end-user
/// display; verbose fault text lives in `details` and is omitted in
/// production mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Status code used for caller-initiated cancellation.
pub const STATUS_CANCELLED: u16 = 499;

impl Failure {
    /// Creates a failure with a message and status code.
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code,
            retry_after: None,
            step: None,
            details: None,
        }
    }

    /// Validation failure (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, 400)
    }

    /// Rate-limit failure (429) with an optional server-suggested delay.
    pub fn rate_limited(retry_after: Option<u64>) -> Self {
        Self {
            retry_after,
            ..Self::new("Too many requests. Please try again later.", 429)
        }
    }

    /// The distinguished cancellation failure (499, step `cancelled`).
    pub fn cancelled() -> Self {
        Self::new("Request was cancelled.", STATUS_CANCELLED).with_step("cancelled")
    }

    /// Internal failure (500) with a generic user-facing message.
    pub fn internal() -> Self {
        Self::new("An unexpected error occurred. Please try again.", 500)
    }

    /// Sets the originating step name.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Attaches verbose fault text for non-production diagnostics.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Sets the step name only if none was recorded by the stage itself.
    pub fn or_step(mut self, step: &str) -> Self {
        self.step.get_or_insert_with(|| step.to_string());
        self
    }
}

/// A value stored in the extension map.
///
/// Bundled stages consume and produce the typed slots they own; anything
/// else rides in [`ExtensionValue::Opaque`] and propagates verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExtensionValue {
    Moderation(ModerationVerdict),
    RateLimit(RateLimitStatus),
    Intent(IntentResult),
    Context(ContextSelection),
    Response(ModelResponse),
    Opaque(JsonValue),
}

impl ExtensionValue {
    pub fn as_intent(&self) -> Option<&IntentResult> {
        match self {
            ExtensionValue::Intent(intent) => Some(intent),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&ContextSelection> {
        match self {
            ExtensionValue::Context(selection) => Some(selection),
            _ => None,
        }
    }

    pub fn as_moderation(&self) -> Option<&ModerationVerdict> {
        match self {
            ExtensionValue::Moderation(verdict) => Some(verdict),
            _ => None,
        }
    }

    pub fn as_rate_limit(&self) -> Option<&RateLimitStatus> {
        match self {
            ExtensionValue::RateLimit(status) => Some(status),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ModelResponse> {
        match self {
            ExtensionValue::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&JsonValue> {
        match self {
            ExtensionValue::Opaque(value) => Some(value),
            _ => None,
        }
    }
}

impl From<JsonValue> for ExtensionValue {
    fn from(value: JsonValue) -> Self {
        ExtensionValue::Opaque(value)
    }
}

/// The mutable-by-supersession record threaded through a plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub request: ChatRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, ExtensionValue>,
}

impl PipelineState {
    /// Creates a fresh state for the given request.
    pub fn new(request: ChatRequest) -> Self {
        Self {
            request,
            failure: None,
            extensions: HashMap::new(),
        }
    }

    /// Returns a superseding state with the extension set.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Returns a superseding state carrying the failure descriptor.
    pub fn fail(mut self, failure: Failure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// True once a stage has rejected the request.
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn extension(&self, key: &str) -> Option<&ExtensionValue> {
        self.extensions.get(key)
    }

    /// The classified intent, if the intent stage has run.
    pub fn intent(&self) -> Option<&IntentResult> {
        self.extension(keys::INTENT).and_then(ExtensionValue::as_intent)
    }

    /// The prompt context selection, if a context stage has run.
    pub fn prompt_context(&self) -> Option<&ContextSelection> {
        self.extension(keys::PROMPT_CONTEXT)
            .and_then(ExtensionValue::as_context)
    }

    /// The moderation verdict, if the moderation stage has run.
    pub fn moderation(&self) -> Option<&ModerationVerdict> {
        self.extension(keys::CONTENT_MODERATION)
            .and_then(ExtensionValue::as_moderation)
    }

    /// The rate-limit status, if the rate-limit stage has run.
    pub fn rate_limit(&self) -> Option<&RateLimitStatus> {
        self.extension(keys::RATE_LIMIT)
            .and_then(ExtensionValue::as_rate_limit)
    }

    /// The model response, if the generation stage has run.
    pub fn ai_response(&self) -> Option<&ModelResponse> {
        self.extension(keys::AI_RESPONSE)
            .and_then(ExtensionValue::as_response)
    }

    pub fn metadata(&self, key: &str) -> Option<&JsonValue> {
        self.request.metadata.get(key)
    }

    /// The most recent message of the conversation.
    pub fn last_message(&self) -> Option<&Message> {
        self.request.messages.last()
    }

    /// The most recent user-role message.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
    }

    /// Whether the conversation holds at most one user message.
    pub fn is_first_message(&self) -> bool {
        self.request
            .messages
            .iter()
            .filter(|message| message.role == Role::User)
            .count()
            <= 1
    }

    /// Whether the caller identified itself: a `user_id` metadata entry, or
    /// `authenticated` set to `true`.
    pub fn is_authenticated(&self) -> bool {
        self.metadata("user_id").is_some()
            || self
                .metadata("authenticated")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with(messages: Vec<Message>) -> PipelineState {
        PipelineState::new(ChatRequest::new(messages))
    }

    #[test]
    fn test_message_text_joins_parts() {
        let message = Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "hello".to_string(),
                },
                ContentPart::Data {
                    kind: "image".to_string(),
                    payload: json!({"url": "x"}),
                },
                ContentPart::Text {
                    text: "world".to_string(),
                },
            ]),
        };
        assert_eq!(message.text(), "hello world");
    }

    #[test]
    fn test_with_extension_supersedes() {
        let state = state_with(vec![Message::user("hi")])
            .with_extension("profile", json!({"name": "a"}))
            .with_extension("profile", json!({"name": "b"}));

        let value = state.extension("profile").and_then(ExtensionValue::as_opaque);
        assert_eq!(value, Some(&json!({"name": "b"})));
    }

    #[test]
    fn test_is_first_message_counts_user_roles() {
        let first = state_with(vec![Message::system("rules"), Message::user("hi")]);
        assert!(first.is_first_message());

        let follow_up = state_with(vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("more"),
        ]);
        assert!(!follow_up.is_first_message());
    }

    #[test]
    fn test_is_authenticated() {
        let anonymous = state_with(vec![Message::user("hi")]);
        assert!(!anonymous.is_authenticated());

        let by_id = PipelineState::new(
            ChatRequest::new(vec![Message::user("hi")]).with_metadata("user_id", "u-1"),
        );
        assert!(by_id.is_authenticated());

        let by_flag = PipelineState::new(
            ChatRequest::new(vec![Message::user("hi")]).with_metadata("authenticated", true),
        );
        assert!(by_flag.is_authenticated());
    }

    #[test]
    fn test_failure_or_step_keeps_existing() {
        let failure = Failure::bad_request("no").with_step("moderation").or_step("other");
        assert_eq!(failure.step.as_deref(), Some("moderation"));

        let defaulted = Failure::internal().or_step("generation");
        assert_eq!(defaulted.step.as_deref(), Some("generation"));
    }

    #[test]
    fn test_message_content_serde_shapes() {
        let plain: Message = serde_json::from_value(json!({
            "role": "user",
            "content": "hi"
        }))
        .unwrap();
        assert_eq!(plain.text(), "hi");

        let parts: Message = serde_json::from_value(json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "hello"}]
        }))
        .unwrap();
        assert_eq!(parts.text(), "hello");
    }
}
