//! Content moderation stage.
//!
//! Screens the last user message against spam patterns, a profanity word
//! list, and custom rules. Patterns compile case-insensitively at
//! construction; an invalid pattern is skipped with a warning rather than
//! poisoning the stage, and moderation's own problems never reject a
//! request - the verdict records them and the message passes through.

use crate::executor::{Stage, StageContext, StageError, StageHandler};
use crate::state::{ExtensionValue, Failure, PipelineState, Role, keys};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Canonical stage name; also the `step` recorded on moderation failures.
pub const STAGE_NAME: &str = "content_moderation";

/// What moderation concluded about a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Detail recorded when moderation itself degraded (for example invalid
    /// configured patterns). The message still passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModerationVerdict {
    fn pass(error: Option<String>) -> Self {
        Self {
            passed: true,
            reason: None,
            error,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            error: None,
        }
    }
}

/// A caller-supplied moderation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRule {
    /// Regex source, compiled case-insensitively.
    pub pattern: String,
    /// Recorded as the verdict reason on match.
    pub reason: String,
}

impl CustomRule {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Moderation configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Regex sources, compiled case-insensitively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spam_patterns: Vec<String>,
    /// Matched as lowercase substrings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profanity_words: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_rules: Vec<CustomRule>,
}

impl ModerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spam_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spam_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_profanity_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profanity_words = words.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_custom_rules(mut self, rules: Vec<CustomRule>) -> Self {
        self.custom_rules = rules;
        self
    }
}

/// Screens user messages before anything expensive runs.
pub struct ModerationStage {
    spam: Vec<Regex>,
    profanity: Vec<String>,
    custom: Vec<(Regex, String)>,
    /// Pattern sources that failed to compile and were skipped.
    degraded: Vec<String>,
}

impl ModerationStage {
    pub fn new(config: ModerationConfig) -> Self {
        let mut degraded = Vec::new();
        let mut compile = |source: &str| match RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
        {
            Ok(regex) => Some(regex),
            Err(error) => {
                warn!(pattern = source, %error, "invalid moderation pattern skipped");
                degraded.push(source.to_string());
                None
            }
        };

        let spam = config
            .spam_patterns
            .iter()
            .filter_map(|source| compile(source))
            .collect();
        let custom = config
            .custom_rules
            .iter()
            .filter_map(|rule| compile(&rule.pattern).map(|regex| (regex, rule.reason.clone())))
            .collect();

        Self {
            spam,
            profanity: config
                .profanity_words
                .iter()
                .map(|word| word.to_lowercase())
                .collect(),
            custom,
            degraded,
        }
    }

    /// Wraps the stage under its canonical name.
    pub fn into_stage(self) -> Stage {
        Stage::new(STAGE_NAME, self)
    }

    fn degradation_note(&self) -> Option<String> {
        (!self.degraded.is_empty())
            .then(|| format!("invalid patterns skipped: {}", self.degraded.join(", ")))
    }

    fn screen(&self, text: &str) -> Screened {
        for pattern in &self.spam {
            if pattern.is_match(text) {
                return Screened::Reject {
                    verdict: ModerationVerdict::reject(format!(
                        "spam pattern: {}",
                        pattern.as_str()
                    )),
                    message: FLAGGED_MESSAGE,
                };
            }
        }

        let lower = text.to_lowercase();
        for word in &self.profanity {
            if lower.contains(word.as_str()) {
                return Screened::Reject {
                    verdict: ModerationVerdict::reject("profanity"),
                    message: LANGUAGE_MESSAGE,
                };
            }
        }

        for (pattern, reason) in &self.custom {
            if pattern.is_match(text) {
                return Screened::Reject {
                    verdict: ModerationVerdict::reject(reason.clone()),
                    message: FLAGGED_MESSAGE,
                };
            }
        }

        Screened::Pass(ModerationVerdict::pass(self.degradation_note()))
    }
}

const FLAGGED_MESSAGE: &str = "Message flagged as inappropriate.";
const LANGUAGE_MESSAGE: &str = "Message contains inappropriate language.";

enum Screened {
    Pass(ModerationVerdict),
    Reject {
        verdict: ModerationVerdict,
        message: &'static str,
    },
}

#[async_trait]
impl StageHandler for ModerationStage {
    async fn handle(
        &self,
        state: PipelineState,
        _ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        // Only user input is screened; assistant/system/tool turns pass.
        let Some(message) = state.last_message().filter(|message| message.role == Role::User)
        else {
            debug!("no user message to moderate");
            return Ok(state.with_extension(
                keys::CONTENT_MODERATION,
                ExtensionValue::Moderation(ModerationVerdict::pass(None)),
            ));
        };

        match self.screen(&message.text()) {
            Screened::Pass(verdict) => Ok(state.with_extension(
                keys::CONTENT_MODERATION,
                ExtensionValue::Moderation(verdict),
            )),
            Screened::Reject { verdict, message } => {
                let failure = Failure::bad_request(message).with_step(STAGE_NAME);
                Ok(state
                    .with_extension(keys::CONTENT_MODERATION, ExtensionValue::Moderation(verdict))
                    .fail(failure))
            }
        }
    }
}
