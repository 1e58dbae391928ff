//! Lifecycle callbacks fired during plan execution.
//!
//! All hooks are optional and run on the executor's task; they should be
//! fast. Every invocation is supervised: a panicking observer is logged and
//! never fails the plan.

use crate::context::VariantUsed;
use crate::intent::IntentFallback;
use crate::state::Failure;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type StepCompleteFn = dyn Fn(&str, Duration) + Send + Sync;
type ErrorFn = dyn Fn(&Failure) + Send + Sync;
type IntentFallbackFn = dyn Fn(&IntentFallback) + Send + Sync;
type VariantUsedFn = dyn Fn(&VariantUsed) + Send + Sync;

/// Optional observability callbacks.
#[derive(Clone, Default)]
pub struct ExecutorHooks {
    on_step_complete: Option<Arc<StepCompleteFn>>,
    on_error: Option<Arc<ErrorFn>>,
    on_intent_fallback: Option<Arc<IntentFallbackFn>>,
    on_variant_used: Option<Arc<VariantUsedFn>>,
}

impl std::fmt::Debug for ExecutorHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHooks")
            .field("on_step_complete", &self.on_step_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_intent_fallback", &self.on_intent_fallback.is_some())
            .field("on_variant_used", &self.on_variant_used.is_some())
            .finish()
    }
}

impl ExecutorHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after every handler invocation with the stage name and its
    /// duration.
    pub fn on_step_complete(mut self, callback: impl Fn(&str, Duration) + Send + Sync + 'static) -> Self {
        self.on_step_complete = Some(Arc::new(callback));
        self
    }

    /// Called when a stage failure or converted fault ends the plan.
    pub fn on_error(mut self, callback: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called by the intent stage whenever the LLM tier is consulted.
    pub fn on_intent_fallback(
        mut self,
        callback: impl Fn(&IntentFallback) + Send + Sync + 'static,
    ) -> Self {
        self.on_intent_fallback = Some(Arc::new(callback));
        self
    }

    /// Called by the dynamic context stage when a request selects a catalog
    /// variant.
    pub fn on_variant_used(
        mut self,
        callback: impl Fn(&VariantUsed) + Send + Sync + 'static,
    ) -> Self {
        self.on_variant_used = Some(Arc::new(callback));
        self
    }

    pub(crate) fn step_complete(&self, name: &str, duration: Duration) {
        if let Some(callback) = &self.on_step_complete {
            supervised("on_step_complete", || callback(name, duration));
        }
    }

    pub(crate) fn error(&self, failure: &Failure) {
        if let Some(callback) = &self.on_error {
            supervised("on_error", || callback(failure));
        }
    }

    pub(crate) fn intent_fallback(&self, fallback: &IntentFallback) {
        if let Some(callback) = &self.on_intent_fallback {
            supervised("on_intent_fallback", || callback(fallback));
        }
    }

    pub(crate) fn variant_used(&self, variant: &VariantUsed) {
        if let Some(callback) = &self.on_variant_used {
            supervised("on_variant_used", || callback(variant));
        }
    }
}

fn supervised(name: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(callback = name, "observer callback panicked; continuing");
    }
}
