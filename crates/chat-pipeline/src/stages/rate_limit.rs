//! Rate-limit stage.
//!
//! The limiter state store is an opaque [`RateLimiter`] capability. On a
//! denied check the stage publishes the distinguished 429 failure with the
//! server-suggested `retry_after`; on an allowed check it records the status
//! and lets the plan continue. A limiter backend fault is a stage fault
//! (converted to a 500 by the executor), not a quiet allow.

use crate::executor::{Stage, StageContext, StageError, StageHandler};
use crate::state::{ExtensionValue, Failure, PipelineState, keys};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Canonical stage name; also the `step` recorded on 429 failures.
pub const STAGE_NAME: &str = "rate_limit";

/// A limiter decision, also stored as the stage's extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Seconds the caller should wait before retrying, when denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitStatus {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn denied(retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// A limiter backend fault.
#[derive(Debug, Error)]
#[error("rate limiter error: {0}")]
pub struct RateLimitError(pub String);

/// Opaque rate-limiter capability.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<RateLimitStatus, RateLimitError>;
}

type IdentifierFn = Arc<dyn Fn(&PipelineState) -> String + Send + Sync>;

/// Applies a [`RateLimiter`] to each request.
pub struct RateLimitStage {
    limiter: Arc<dyn RateLimiter>,
    identifier: IdentifierFn,
}

impl RateLimitStage {
    /// Creates a stage identifying callers by `user_id`, then `session_id`,
    /// then `"anonymous"`.
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            identifier: Arc::new(|state| {
                state
                    .metadata("user_id")
                    .or_else(|| state.metadata("session_id"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or("anonymous")
                    .to_string()
            }),
        }
    }

    /// Overrides how the rate-limit identifier is derived.
    pub fn with_identifier(
        mut self,
        identifier: impl Fn(&PipelineState) -> String + Send + Sync + 'static,
    ) -> Self {
        self.identifier = Arc::new(identifier);
        self
    }

    /// Wraps the stage under its canonical name.
    pub fn into_stage(self) -> Stage {
        Stage::new(STAGE_NAME, self)
    }
}

#[async_trait]
impl StageHandler for RateLimitStage {
    async fn handle(
        &self,
        state: PipelineState,
        ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        let identifier = (self.identifier)(&state);
        let status = self
            .limiter
            .check(&identifier, &ctx.cancellation)
            .await
            .map_err(|error| StageError::execution(error.to_string()))?;

        debug!(identifier = %identifier, allowed = status.allowed, "rate limit checked");

        if status.allowed {
            return Ok(state.with_extension(keys::RATE_LIMIT, ExtensionValue::RateLimit(status)));
        }

        let failure = Failure::rate_limited(status.retry_after).with_step(STAGE_NAME);
        Ok(state
            .with_extension(keys::RATE_LIMIT, ExtensionValue::RateLimit(status))
            .fail(failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChatRequest, Message};
    use std::sync::Mutex;

    struct ScriptedLimiter {
        status: RateLimitStatus,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedLimiter {
        fn new(status: RateLimitStatus) -> Self {
            Self {
                status,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RateLimiter for ScriptedLimiter {
        async fn check(
            &self,
            identifier: &str,
            _cancel: &CancellationToken,
        ) -> Result<RateLimitStatus, RateLimitError> {
            self.seen.lock().unwrap().push(identifier.to_string());
            Ok(self.status.clone())
        }
    }

    fn state_with_user(user_id: Option<&str>) -> PipelineState {
        let mut request = ChatRequest::new(vec![Message::user("hi")]);
        if let Some(user_id) = user_id {
            request = request.with_metadata("user_id", user_id);
        }
        PipelineState::new(request)
    }

    #[tokio::test]
    async fn test_allowed_records_status_and_continues() {
        let limiter = Arc::new(ScriptedLimiter::new(RateLimitStatus::allowed()));
        let stage = RateLimitStage::new(Arc::clone(&limiter) as Arc<dyn RateLimiter>);

        let result = stage
            .handle(state_with_user(Some("u-1")), StageContext::detached())
            .await
            .unwrap();

        assert!(!result.failed());
        assert!(result.rate_limit().unwrap().allowed);
        assert_eq!(*limiter.seen.lock().unwrap(), vec!["u-1"]);
    }

    #[tokio::test]
    async fn test_denied_publishes_429_with_retry_after() {
        let limiter = Arc::new(ScriptedLimiter::new(RateLimitStatus::denied(Some(30))));
        let stage = RateLimitStage::new(limiter);

        let result = stage
            .handle(state_with_user(None), StageContext::detached())
            .await
            .unwrap();

        let failure = result.failure.clone().unwrap();
        assert_eq!(failure.status_code, 429);
        assert_eq!(failure.retry_after, Some(30));
        assert_eq!(failure.step.as_deref(), Some(STAGE_NAME));
        assert_eq!(failure.message, "Too many requests. Please try again later.");
        assert!(!result.rate_limit().unwrap().allowed);
    }

    #[tokio::test]
    async fn test_anonymous_identifier_fallback() {
        let limiter = Arc::new(ScriptedLimiter::new(RateLimitStatus::allowed()));
        let stage = RateLimitStage::new(Arc::clone(&limiter) as Arc<dyn RateLimiter>);

        stage
            .handle(state_with_user(None), StageContext::detached())
            .await
            .unwrap();

        assert_eq!(*limiter.seen.lock().unwrap(), vec!["anonymous"]);
    }

    #[tokio::test]
    async fn test_limiter_fault_is_a_stage_fault() {
        struct BrokenLimiter;

        #[async_trait]
        impl RateLimiter for BrokenLimiter {
            async fn check(
                &self,
                _identifier: &str,
                _cancel: &CancellationToken,
            ) -> Result<RateLimitStatus, RateLimitError> {
                Err(RateLimitError("redis unreachable".to_string()))
            }
        }

        let stage = RateLimitStage::new(Arc::new(BrokenLimiter));
        let result = stage
            .handle(state_with_user(None), StageContext::detached())
            .await;

        assert!(matches!(result, Err(StageError::Execution(_))));
    }
}
