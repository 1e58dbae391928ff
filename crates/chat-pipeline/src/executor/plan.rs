//! Plan model: named stages, parallel groups, and the builder that
//! validates them.

use crate::conditions::Condition;
use crate::executor::config::ExecutorConfig;
use crate::executor::error::{PlanError, StageError};
use crate::executor::hooks::ExecutorHooks;
use crate::state::PipelineState;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execution context handed to every stage invocation.
///
/// Carries the caller's cancellation token (handlers are expected to return
/// promptly once it fires) and the lifecycle hooks stages may surface events
/// through.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub cancellation: CancellationToken,
    pub hooks: ExecutorHooks,
}

impl StageContext {
    /// A detached context for driving stages outside an executor (tests,
    /// ad-hoc invocation).
    pub fn detached() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            hooks: ExecutorHooks::default(),
        }
    }

    pub(crate) fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            cancellation: config.cancellation.clone(),
            hooks: config.hooks.clone(),
        }
    }
}

/// A processing step: consumes a state, publishes its successor.
///
/// Returning a state whose `failure` field is set terminates the plan.
/// Returning `Err` is a runtime fault; the executor converts it into a
/// generic 500 failure.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(
        &self,
        state: PipelineState,
        ctx: StageContext,
    ) -> Result<PipelineState, StageError>;
}

type BoxedHandlerFn = dyn Fn(PipelineState, StageContext) -> BoxFuture<'static, Result<PipelineState, StageError>>
    + Send
    + Sync;

/// Adapter making a plain async closure a [`StageHandler`].
struct FnHandler(Box<BoxedHandlerFn>);

#[async_trait]
impl StageHandler for FnHandler {
    async fn handle(
        &self,
        state: PipelineState,
        ctx: StageContext,
    ) -> Result<PipelineState, StageError> {
        (self.0)(state, ctx).await
    }
}

/// A named stage within a plan.
#[derive(Clone)]
pub struct Stage {
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn StageHandler>,
    pub(crate) enabled: bool,
    pub(crate) should_execute: Option<Condition>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("gated", &self.should_execute.is_some())
            .finish()
    }
}

impl Stage {
    /// Creates a stage from a handler implementation.
    pub fn new(name: impl Into<String>, handler: impl StageHandler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            enabled: true,
            should_execute: None,
        }
    }

    /// Creates a stage from an async closure.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let stage = Stage::from_fn("annotate", |state, _ctx| async move {
    ///     Ok(state.with_extension("annotated", serde_json::json!(true)))
    /// });
    /// ```
    pub fn from_fn<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(PipelineState, StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PipelineState, StageError>> + Send + 'static,
    {
        let boxed = move |state, ctx| handler(state, ctx).boxed();
        Self::new(name, FnHandler(Box::new(boxed)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Statically enables or disables the stage.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Disables the stage; the executor skips it without evaluating its
    /// condition.
    pub fn disabled(self) -> Self {
        self.with_enabled(false)
    }

    /// Gates the stage behind a condition evaluated against the state the
    /// stage would receive.
    pub fn when(mut self, condition: Condition) -> Self {
        self.should_execute = Some(condition);
        self
    }
}

/// One element of a plan: a single stage or a parallel group.
#[derive(Debug, Clone)]
pub enum PlanEntry {
    Stage(Stage),
    /// Stages scheduled concurrently and joined before the next entry.
    /// Their outputs merge in declaration order, later stages overwriting
    /// earlier ones on extension-key conflicts.
    Parallel(Vec<Stage>),
}

/// A validated, ordered configuration of processing stages.
///
/// Plans are long-lived: build once, share across executions.
#[derive(Debug, Clone)]
pub struct Plan {
    entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn builder() -> PlanBuilder {
        PlanBuilder {
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Total number of stages, parallel group members included.
    pub fn stage_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry {
                PlanEntry::Stage(_) => 1,
                PlanEntry::Parallel(stages) => stages.len(),
            })
            .sum()
    }
}

/// Builds and validates a [`Plan`].
#[derive(Debug, Default)]
pub struct PlanBuilder {
    entries: Vec<PlanEntry>,
}

impl PlanBuilder {
    /// Appends a single stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.entries.push(PlanEntry::Stage(stage));
        self
    }

    /// Appends a parallel group.
    pub fn parallel(mut self, stages: Vec<Stage>) -> Self {
        self.entries.push(PlanEntry::Parallel(stages));
        self
    }

    /// Validates the plan: at least one entry, no empty groups, stage names
    /// unique across the whole plan.
    pub fn build(self) -> Result<Plan, PlanError> {
        if self.entries.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut names = HashSet::new();
        for entry in &self.entries {
            let stages: Vec<&Stage> = match entry {
                PlanEntry::Stage(stage) => vec![stage],
                PlanEntry::Parallel(stages) => {
                    if stages.is_empty() {
                        return Err(PlanError::EmptyParallelGroup);
                    }
                    stages.iter().collect()
                }
            };
            for stage in stages {
                if !names.insert(stage.name.clone()) {
                    return Err(PlanError::DuplicateStageName(stage.name.clone()));
                }
            }
        }

        Ok(Plan {
            entries: self.entries,
        })
    }
}
