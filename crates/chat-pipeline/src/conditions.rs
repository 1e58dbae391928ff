//! Condition predicates used to gate stage execution.
//!
//! A [`Condition`] is a pure, async-aware predicate over [`PipelineState`].
//! Predicates compose with [`and`] (short-circuit on false), [`or`]
//! (short-circuit on true) and [`not`]. The executor awaits a stage's
//! condition against the current state before invoking its handler.

use crate::state::{ExtensionValue, PipelineState};
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::Arc;

type Predicate = dyn for<'a> Fn(&'a PipelineState) -> BoxFuture<'a, bool> + Send + Sync;

/// A first-class predicate over pipeline state.
#[derive(Clone)]
pub struct Condition {
    eval: Arc<Predicate>,
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Condition")
    }
}

impl Condition {
    /// Builds a condition from a synchronous predicate.
    pub fn from_fn(predicate: impl Fn(&PipelineState) -> bool + Send + Sync + 'static) -> Self {
        Self {
            eval: Arc::new(move |state| {
                let value = predicate(state);
                Box::pin(async move { value })
            }),
        }
    }

    /// Builds a condition from an asynchronous predicate.
    pub fn from_async<F>(predicate: F) -> Self
    where
        F: for<'a> Fn(&'a PipelineState) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        Self {
            eval: Arc::new(predicate),
        }
    }

    /// Evaluates the predicate against a state.
    pub async fn evaluate(&self, state: &PipelineState) -> bool {
        (self.eval)(state).await
    }

    /// Both this and `other` hold.
    pub fn and(self, other: Condition) -> Condition {
        and(vec![self, other])
    }

    /// Either this or `other` holds.
    pub fn or(self, other: Condition) -> Condition {
        or(vec![self, other])
    }

    /// The negation of this condition.
    pub fn negate(self) -> Condition {
        not(self)
    }
}

/// True iff every condition holds. Evaluation short-circuits on the first
/// false result.
pub fn and(conditions: Vec<Condition>) -> Condition {
    Condition::from_async(move |state| {
        let conditions = conditions.clone();
        Box::pin(async move {
            for condition in &conditions {
                if !condition.evaluate(state).await {
                    return false;
                }
            }
            true
        })
    })
}

/// True iff at least one condition holds. Evaluation short-circuits on the
/// first true result.
pub fn or(conditions: Vec<Condition>) -> Condition {
    Condition::from_async(move |state| {
        let conditions = conditions.clone();
        Box::pin(async move {
            for condition in &conditions {
                if condition.evaluate(state).await {
                    return true;
                }
            }
            false
        })
    })
}

/// The negation of a condition.
pub fn not(condition: Condition) -> Condition {
    Condition::from_async(move |state| {
        let condition = condition.clone();
        Box::pin(async move { !condition.evaluate(state).await })
    })
}

/// The classified intent equals `category`.
pub fn has_intent(category: impl Into<String>) -> Condition {
    let category = category.into();
    Condition::from_fn(move |state| {
        state
            .intent()
            .is_some_and(|intent| intent.intent == category)
    })
}

/// The request carries a metadata entry under `key`.
pub fn has_metadata(key: impl Into<String>) -> Condition {
    let key = key.into();
    Condition::from_fn(move |state| state.metadata(&key).is_some())
}

/// The request carries `key` with exactly `value`.
pub fn has_metadata_value(key: impl Into<String>, value: JsonValue) -> Condition {
    let key = key.into();
    Condition::from_fn(move |state| state.metadata(&key) == Some(&value))
}

/// The state carries an extension under `key`.
pub fn has_extension(key: impl Into<String>) -> Condition {
    let key = key.into();
    Condition::from_fn(move |state| state.extension(&key).is_some())
}

/// The state carries `key` with exactly `value`.
pub fn has_extension_value(key: impl Into<String>, value: ExtensionValue) -> Condition {
    let key = key.into();
    Condition::from_fn(move |state| state.extension(&key) == Some(&value))
}

/// The conversation holds at most one user message.
pub fn is_first_message() -> Condition {
    Condition::from_fn(PipelineState::is_first_message)
}

/// The caller identified itself (`user_id` metadata or `authenticated: true`).
pub fn is_authenticated() -> Condition {
    Condition::from_fn(PipelineState::is_authenticated)
}

/// The last message's text content matches `pattern`.
pub fn matches_pattern(pattern: Regex) -> Condition {
    Condition::from_fn(move |state| {
        state
            .last_message()
            .is_some_and(|message| pattern.is_match(&message.text()))
    })
}
