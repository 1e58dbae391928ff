//! Configuration for pipeline execution behavior.

use crate::executor::hooks::ExecutorHooks;
use tokio_util::sync::CancellationToken;

/// Per-execution configuration.
///
/// # Examples
///
/// ```ignore
/// use chat_pipeline::executor::{ExecutorConfig, ExecutorHooks};
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let config = ExecutorConfig::new()
///     .with_cancellation(token.clone())
///     .with_hooks(ExecutorHooks::new().on_step_complete(|name, d| {
///         println!("{name} took {d:?}");
///     }));
/// ```
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Caller-provided cancellation token. Fires once; the executor stops
    /// starting entries and signals in-flight stages.
    pub cancellation: CancellationToken,

    /// Whether failure descriptors keep verbose fault text in `details`.
    ///
    /// The user-facing `message` is always a stable generic string; this
    /// only gates diagnostics. Defaults to on in debug builds and off in
    /// release builds.
    pub include_error_details: bool,

    /// Lifecycle callbacks.
    pub hooks: ExecutorHooks,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            include_error_details: cfg!(debug_assertions),
            hooks: ExecutorHooks::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_error_details(mut self, include: bool) -> Self {
        self.include_error_details = include;
        self
    }

    pub fn with_hooks(mut self, hooks: ExecutorHooks) -> Self {
        self.hooks = hooks;
        self
    }
}
