//! Bundled pipeline stages.
//!
//! Each stage is a [`StageHandler`](crate::executor::StageHandler) that
//! consumes and produces the typed extension slot it owns (see
//! [`state::keys`](crate::state::keys)). Stages are building blocks: a
//! caller assembles them into a [`Plan`](crate::executor::Plan) alongside
//! its own handlers.

pub mod context;
pub mod generation;
pub mod intent;
pub mod moderation;
pub mod rate_limit;

pub use context::{DynamicContextStage, StaticContextStage};
pub use generation::GenerationStage;
pub use intent::IntentStage;
pub use moderation::{CustomRule, ModerationConfig, ModerationStage, ModerationVerdict};
pub use rate_limit::{RateLimitError, RateLimitStage, RateLimitStatus, RateLimiter};
