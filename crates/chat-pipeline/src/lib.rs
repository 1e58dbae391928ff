//! `chat-pipeline` - a composable execution engine for AI-assisted request
//! processing.
//!
//! A caller assembles an ordered [`Plan`](executor::Plan) of named
//! processing stages - moderation, rate limiting, intent classification,
//! prompt-context assembly, model invocation - and submits a
//! [`ChatRequest`](state::ChatRequest) carrying a conversation plus
//! arbitrary metadata. The [`PipelineExecutor`](executor::PipelineExecutor)
//! drives the plan, threading a mutable-by-supersession
//! [`PipelineState`](state::PipelineState) through the stages, surfaces the
//! first failure, and returns the accumulated state.
//!
//! External concerns stay behind capability traits: model invocation
//! ([`ModelInvoker`](model::ModelInvoker)), rate-limit storage
//! ([`RateLimiter`](stages::RateLimiter)), context persistence
//! ([`ContextLoader`](context::ContextLoader)), and the semantic intent tier
//! ([`LlmIntentTier`](intent::LlmIntentTier)). The engine specifies none of
//! their transports.
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_pipeline::executor::{ExecutorConfig, PipelineExecutor, Plan};
//! use chat_pipeline::intent::{HybridIntentResolver, IntentPattern, KeywordClassifier};
//! use chat_pipeline::stages::{IntentStage, ModerationConfig, ModerationStage};
//! use chat_pipeline::state::{ChatRequest, Message, PipelineState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let classifier = KeywordClassifier::new(vec![
//!         IntentPattern::new("greeting", ["hello", "hi"]),
//!     ]);
//!     let plan = Plan::builder()
//!         .stage(ModerationStage::new(ModerationConfig::new()).into_stage())
//!         .stage(IntentStage::new(Arc::new(HybridIntentResolver::new(classifier))).into_stage())
//!         .build()
//!         .expect("valid plan");
//!
//!     let initial = PipelineState::new(ChatRequest::new(vec![Message::user("hello!")]));
//!     let outcome = PipelineExecutor::new(ExecutorConfig::new())
//!         .execute(initial, &plan)
//!         .await;
//!
//!     assert!(outcome.ok);
//!     println!("intent: {:?}", outcome.state.intent());
//! }
//! ```

pub mod cache;
pub mod conditions;
pub mod context;
pub mod executor;
pub mod intent;
pub mod model;
pub mod observability;
pub mod stages;
pub mod state;

pub use cache::{CacheError, TtlCache};
pub use conditions::Condition;
pub use context::{
    ContextLoader, ContextOptimizer, ContextPolicy, ContextSection, ContextSelection,
    DynamicContextEngine, SelectionRequest,
};
pub use executor::{
    ExecutionOutcome, ExecutorConfig, ExecutorHooks, PipelineExecutor, Plan, PlanError, Stage,
    StageContext, StageError, StageHandler,
};
pub use intent::{
    HybridIntentResolver, IntentPattern, IntentResult, KeywordClassifier, LlmIntentTier,
};
pub use model::{GenerationRequest, ModelInvoker, ModelResponse};
pub use state::{ChatRequest, Failure, Message, PipelineState};
