//! Prompt-context assembly.
//!
//! [`ContextOptimizer`] selects and orders sections from a static catalog by
//! topic, priority and first-vs-follow-up policy, appends tone text, and
//! reports coarse token estimates. [`DynamicContextEngine`] runs the same
//! selection pass over catalogs loaded from an external [`ContextLoader`],
//! cached per variant with single-flight TTL semantics.

pub mod dynamic;
pub mod optimizer;

pub use dynamic::{
    ContextExtractors, ContextLoadError, ContextLoader, DynamicContextEngine, LoaderQuery,
    VariantUsed,
};
pub use optimizer::{
    ContextOptimizer, ContextPolicy, ContextSection, ContextSelection, SelectionMode,
    SelectionRequest,
};
