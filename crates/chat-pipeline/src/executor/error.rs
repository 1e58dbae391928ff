//! Error types for plan construction and stage execution.

use crate::cache::CacheError;
use crate::context::ContextLoadError;
use crate::model::ModelError;
use thiserror::Error;

/// Errors raised while building a [`Plan`](crate::executor::Plan).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A plan must hold at least one entry.
    #[error("plan has no entries")]
    Empty,

    /// Stage names must be unique across the whole plan, parallel group
    /// members included.
    #[error("duplicate stage name: {0}")]
    DuplicateStageName(String),

    /// A parallel group must hold at least one stage.
    #[error("parallel group has no stages")]
    EmptyParallelGroup,
}

/// A runtime fault inside a stage handler.
///
/// Distinct from a returned failure descriptor: a stage that *rejects* a
/// request publishes a state with its `failure` set, while a stage that
/// *faults* returns this error and the executor converts it into a generic
/// 500 failure (details preserved only outside production mode).
#[derive(Debug, Error)]
pub enum StageError {
    /// Generic handler fault.
    #[error("stage execution failed: {0}")]
    Execution(String),

    /// A model invocation failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A cache load failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A context backend failed.
    #[error(transparent)]
    ContextLoad(#[from] ContextLoadError),
}

impl StageError {
    /// Creates a generic execution fault.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}
