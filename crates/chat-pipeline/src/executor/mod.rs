//! Step executor - drives an ordered plan over a pipeline state.
//!
//! The executor iterates plan entries in declaration order, threading a
//! rolling state through them. Single stages run one at a time; parallel
//! groups run their members concurrently against the same input snapshot and
//! merge extensions in declaration order (later stages win on conflicts).
//! The first failure is final: there is no retry at this layer, and
//! subsequent stages are not invoked. Transient retry, where wanted, belongs
//! to the handler itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_pipeline::executor::{ExecutorConfig, PipelineExecutor, Plan, Stage};
//! use chat_pipeline::state::{ChatRequest, Message, PipelineState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let plan = Plan::builder()
//!         .stage(Stage::from_fn("annotate", |state, _ctx| async move {
//!             Ok(state.with_extension("annotated", serde_json::json!(true)))
//!         }))
//!         .build()
//!         .unwrap();
//!
//!     let initial = PipelineState::new(ChatRequest::new(vec![Message::user("hi")]));
//!     let outcome = PipelineExecutor::new(ExecutorConfig::new())
//!         .execute(initial, &plan)
//!         .await;
//!     assert!(outcome.ok);
//! }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod plan;

pub use config::ExecutorConfig;
pub use error::{PlanError, StageError};
pub use hooks::ExecutorHooks;
pub use plan::{Plan, PlanBuilder, PlanEntry, Stage, StageContext, StageHandler};

use crate::state::{Failure, PipelineState};
use futures::future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info_span, warn};

/// What an execution produced.
///
/// `ok` is false iff some stage produced a failure descriptor, faulted, or
/// the execution was cancelled; `failure` then describes the first such
/// event and `state` is the last published record carrying it.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub state: PipelineState,
    pub failure: Option<Failure>,
}

/// Drives plans to completion.
#[derive(Debug, Default)]
pub struct PipelineExecutor {
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `plan` over `initial`.
    ///
    /// Terminal per execution: the returned state is discarded or kept by
    /// the caller; the executor holds no state between runs and a plan can
    /// be shared across concurrent executions.
    pub async fn execute(&self, initial: PipelineState, plan: &Plan) -> ExecutionOutcome {
        let ctx = StageContext::from_config(&self.config);

        async move {
            let mut current = initial;

            for entry in plan.entries() {
                if ctx.cancellation.is_cancelled() {
                    return self.finish_cancelled(current);
                }

                match entry {
                    PlanEntry::Stage(stage) => {
                        match self.run_stage(stage, current, &ctx).await {
                            StageOutcome::Next(next) => current = next,
                            StageOutcome::Finished(outcome) => return outcome,
                        }
                    }
                    PlanEntry::Parallel(stages) => {
                        match self.run_group(stages, current, &ctx).await {
                            StageOutcome::Next(next) => current = next,
                            StageOutcome::Finished(outcome) => return outcome,
                        }
                    }
                }
            }

            ExecutionOutcome {
                ok: true,
                state: current,
                failure: None,
            }
        }
        .instrument(info_span!("pipeline_execute", entries = plan.entries().len()))
        .await
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        current: PipelineState,
        ctx: &StageContext,
    ) -> StageOutcome {
        if !stage.enabled {
            debug!(stage = %stage.name, "stage disabled, skipping");
            return StageOutcome::Next(current);
        }
        if let Some(condition) = &stage.should_execute {
            if !condition.evaluate(&current).await {
                debug!(stage = %stage.name, "condition gated stage out");
                return StageOutcome::Next(current);
            }
        }

        let started = Instant::now();
        let result = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return StageOutcome::Finished(self.finish_cancelled(current));
            }
            result = stage.handler.handle(current.clone(), ctx.clone()) => result,
        };
        self.config.hooks.step_complete(&stage.name, started.elapsed());

        match result {
            Ok(next) => {
                if let Some(failure) = next.failure.clone() {
                    let failure = failure.or_step(&stage.name);
                    StageOutcome::Finished(self.finish_failure(next, failure))
                } else {
                    StageOutcome::Next(next)
                }
            }
            Err(fault) => {
                error!(stage = %stage.name, error = %fault, "stage handler faulted");
                let failure = Failure::internal()
                    .with_step(&stage.name)
                    .with_details(fault.to_string());
                StageOutcome::Finished(self.finish_failure(current, failure))
            }
        }
    }

    async fn run_group(
        &self,
        stages: &[Stage],
        mut current: PipelineState,
        ctx: &StageContext,
    ) -> StageOutcome {
        // Enablement and conditions are evaluated against the group's input
        // snapshot, before any member runs.
        let mut active: Vec<&Stage> = Vec::new();
        for stage in stages {
            if !stage.enabled {
                debug!(stage = %stage.name, "stage disabled, skipping");
                continue;
            }
            if let Some(condition) = &stage.should_execute {
                if !condition.evaluate(&current).await {
                    debug!(stage = %stage.name, "condition gated stage out");
                    continue;
                }
            }
            active.push(stage);
        }
        if active.is_empty() {
            return StageOutcome::Next(current);
        }

        let members = active.iter().map(|stage| {
            let handler = Arc::clone(&stage.handler);
            let snapshot = current.clone();
            let stage_ctx = ctx.clone();
            let name = stage.name.clone();
            async move {
                let started = Instant::now();
                let result = handler.handle(snapshot, stage_ctx).await;
                (name, started.elapsed(), result)
            }
        });

        let results = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return StageOutcome::Finished(self.finish_cancelled(current));
            }
            results = future::join_all(members) => results,
        };

        // Completion callbacks fire on the executor task, in declaration
        // order, with each member's own duration.
        for (name, duration, _) in &results {
            self.config.hooks.step_complete(name, *duration);
        }

        // First failure by declaration order wins; sibling side effects are
        // discarded.
        let mut succeeded = Vec::with_capacity(results.len());
        for (name, _, result) in results {
            match result {
                Err(fault) => {
                    error!(stage = %name, error = %fault, "parallel stage handler faulted");
                    let failure = Failure::internal()
                        .with_step(&name)
                        .with_details(fault.to_string());
                    return StageOutcome::Finished(self.finish_failure(current, failure));
                }
                Ok(state) => {
                    if let Some(failure) = state.failure.clone() {
                        let failure = failure.or_step(&name);
                        return StageOutcome::Finished(self.finish_failure(state, failure));
                    }
                    succeeded.push(state);
                }
            }
        }

        // Merge: fold each member's extensions over the input snapshot in
        // declaration order. Request and failure fields never merge from
        // parallel members.
        for state in succeeded {
            for (key, value) in state.extensions {
                current.extensions.insert(key, value);
            }
        }
        StageOutcome::Next(current)
    }

    fn finish_failure(&self, mut state: PipelineState, mut failure: Failure) -> ExecutionOutcome {
        if !self.config.include_error_details {
            failure.details = None;
        }
        state.failure = Some(failure.clone());
        self.config.hooks.error(&failure);
        ExecutionOutcome {
            ok: false,
            state,
            failure: Some(failure),
        }
    }

    fn finish_cancelled(&self, state: PipelineState) -> ExecutionOutcome {
        warn!("pipeline execution cancelled");
        let failure = Failure::cancelled();
        ExecutionOutcome {
            ok: false,
            state: state.fail(failure.clone()),
            failure: Some(failure),
        }
    }
}

enum StageOutcome {
    /// The rolling state after the entry completed.
    Next(PipelineState),
    /// The execution ended inside the entry.
    Finished(ExecutionOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions;
    use crate::state::{ChatRequest, Message};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn initial() -> PipelineState {
        PipelineState::new(ChatRequest::new(vec![Message::user("hi")]))
    }

    fn writes(name: &'static str, key: &'static str, value: serde_json::Value) -> Stage {
        Stage::from_fn(name, move |state, _ctx| {
            let value = value.clone();
            async move { Ok(state.with_extension(key, value)) }
        })
    }

    #[tokio::test]
    async fn test_sequential_threading() {
        let plan = Plan::builder()
            .stage(writes("a", "first", json!(1)))
            .stage(writes("b", "second", json!(2)))
            .build()
            .unwrap();

        let outcome = PipelineExecutor::default().execute(initial(), &plan).await;

        assert!(outcome.ok);
        assert!(outcome.state.extension("first").is_some());
        assert!(outcome.state.extension("second").is_some());
    }

    #[tokio::test]
    async fn test_disabled_stage_skipped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let plan = Plan::builder()
            .stage(
                Stage::from_fn("off", move |state, _ctx| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(state) }
                })
                .disabled(),
            )
            .stage(writes("on", "ran", json!(true)))
            .build()
            .unwrap();

        let outcome = PipelineExecutor::default().execute(initial(), &plan).await;

        assert!(outcome.ok);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(outcome.state.extension("ran").is_some());
    }

    #[tokio::test]
    async fn test_condition_gates_stage() {
        let plan = Plan::builder()
            .stage(writes("gated", "gated", json!(true)).when(conditions::has_metadata("absent")))
            .build()
            .unwrap();

        let outcome = PipelineExecutor::default().execute(initial(), &plan).await;

        assert!(outcome.ok);
        assert!(outcome.state.extension("gated").is_none());
    }

    #[tokio::test]
    async fn test_returned_failure_stops_plan_and_records_step() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let plan = Plan::builder()
            .stage(Stage::from_fn("reject", |state, _ctx| async move {
                Ok(state.fail(Failure::bad_request("nope")))
            }))
            .stage(Stage::from_fn("after", move |state, _ctx| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok(state) }
            }))
            .build()
            .unwrap();

        let outcome = PipelineExecutor::default().execute(initial(), &plan).await;

        assert!(!outcome.ok);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.status_code, 400);
        assert_eq!(failure.step.as_deref(), Some("reject"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fault_converted_to_500_with_gated_details() {
        let plan = Plan::builder()
            .stage(Stage::from_fn("boom", |_state, _ctx| async move {
                Err::<PipelineState, _>(StageError::execution("disk on fire"))
            }))
            .build()
            .unwrap();

        let verbose = PipelineExecutor::new(ExecutorConfig::new().with_error_details(true))
            .execute(initial(), &plan)
            .await;
        let failure = verbose.failure.unwrap();
        assert_eq!(failure.status_code, 500);
        assert_eq!(failure.step.as_deref(), Some("boom"));
        assert!(failure.details.unwrap().contains("disk on fire"));

        let production = PipelineExecutor::new(ExecutorConfig::new().with_error_details(false))
            .execute(initial(), &plan)
            .await;
        assert!(production.failure.unwrap().details.is_none());
    }

    #[tokio::test]
    async fn test_step_complete_fires_per_invoked_stage() {
        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        let config = ExecutorConfig::new().with_hooks(ExecutorHooks::new().on_step_complete(
            move |name, _| {
                sink.lock().unwrap().push(name.to_string());
            },
        ));

        let plan = Plan::builder()
            .stage(writes("a", "a", json!(1)))
            .stage(writes("skip", "skip", json!(1)).disabled())
            .parallel(vec![writes("b", "b", json!(1)), writes("c", "c", json!(1))])
            .build()
            .unwrap();

        let outcome = PipelineExecutor::new(config).execute(initial(), &plan).await;

        assert!(outcome.ok);
        assert_eq!(*names.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
