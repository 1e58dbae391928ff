//! Dynamic context engine - externally sourced catalogs behind a TTL cache.
//!
//! The engine combines a [`ContextLoader`] capability with the optimizer's
//! selection pass and a [`TtlCache`]. The cache key is the variant alone
//! (`"default"` when none): the cache stores the source-of-truth catalog per
//! variant, and topic/first-message filtering happens on every call after
//! the load. Concurrent misses on one variant coalesce into a single
//! backend load.

use crate::cache::{CacheError, TtlCache};
use crate::context::optimizer::{
    ContextOptimizer, ContextPolicy, ContextSection, ContextSelection, SelectionRequest,
    select_sections,
};
use crate::intent::GENERAL_INTENT;
use crate::state::PipelineState;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors surfaced by context loaders.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextLoadError {
    /// The backing store failed or was unreachable.
    #[error("context backend error: {0}")]
    Backend(String),

    /// The requested variant does not exist in the backing store.
    #[error("unknown context variant: {0}")]
    UnknownVariant(String),
}

/// What the engine asks a loader for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoaderQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default)]
    pub is_first_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,
}

/// Capability for sourcing context sections from external storage.
#[async_trait]
pub trait ContextLoader: Send + Sync {
    async fn load(
        &self,
        query: &LoaderQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContextSection>, ContextLoadError>;
}

/// Observability payload emitted when a request selects a catalog variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantUsed {
    pub variant: String,
}

type Extractor<T> = Arc<dyn Fn(&PipelineState) -> T + Send + Sync>;

/// How the engine derives its inputs from pipeline state.
///
/// The defaults read the slots the bundled stages populate: topics from the
/// `topics` metadata array or the classified intent, tone from the intent's
/// metadata, variant from the `context_variant` metadata entry.
#[derive(Clone)]
pub struct ContextExtractors {
    pub topics: Extractor<Vec<String>>,
    pub tone: Extractor<Option<String>>,
    pub variant: Extractor<Option<String>>,
}

impl Default for ContextExtractors {
    fn default() -> Self {
        Self {
            topics: Arc::new(|state| {
                if let Some(topics) = state.metadata("topics").and_then(JsonValue::as_array) {
                    return topics
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .map(str::to_string)
                        .collect();
                }
                state
                    .intent()
                    .filter(|intent| intent.intent != GENERAL_INTENT)
                    .map(|intent| vec![intent.intent.clone()])
                    .unwrap_or_default()
            }),
            tone: Arc::new(|state| {
                state
                    .intent()
                    .and_then(|intent| intent.metadata.as_ref())
                    .and_then(|metadata| metadata.tone.clone())
            }),
            variant: Arc::new(|state| {
                state
                    .metadata("context_variant")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
            }),
        }
    }
}

/// Builds prompt context from externally loaded, variant-keyed catalogs.
pub struct DynamicContextEngine {
    loader: Arc<dyn ContextLoader>,
    cache: TtlCache<Vec<ContextSection>>,
    policy: ContextPolicy,
    tone_map: HashMap<String, String>,
    extractors: ContextExtractors,
    fallback: Option<ContextOptimizer>,
}

impl DynamicContextEngine {
    /// Creates an engine over `loader` whose cached catalogs expire after
    /// `ttl`.
    pub fn new(loader: Arc<dyn ContextLoader>, ttl: Duration) -> Self {
        Self {
            loader,
            cache: TtlCache::new(ttl),
            policy: ContextPolicy::default(),
            tone_map: HashMap::new(),
            extractors: ContextExtractors::default(),
            fallback: None,
        }
    }

    pub fn with_policy(mut self, policy: ContextPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Installs the tone map. On fallback the same map applies, so tone
    /// handling stays consistent whichever catalog served the request.
    pub fn with_tone_map(mut self, tone_map: HashMap<String, String>) -> Self {
        self.tone_map = tone_map;
        self
    }

    /// Adds one tone instruction.
    pub fn with_tone(mut self, tone: impl Into<String>, instruction: impl Into<String>) -> Self {
        self.tone_map.insert(tone.into(), instruction.into());
        self
    }

    pub fn with_extractors(mut self, extractors: ContextExtractors) -> Self {
        self.extractors = extractors;
        self
    }

    /// Installs a static optimizer consulted when the loader fails.
    pub fn with_fallback(mut self, fallback: ContextOptimizer) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Access to the variant-keyed catalog cache (invalidation on content
    /// updates).
    pub fn cache(&self) -> &TtlCache<Vec<ContextSection>> {
        &self.cache
    }

    /// The variant this state would select, if any.
    pub fn variant_for(&self, state: &PipelineState) -> Option<String> {
        (self.extractors.variant)(state)
    }

    /// The loader query this state derives.
    pub fn derive_query(&self, state: &PipelineState) -> LoaderQuery {
        LoaderQuery {
            topics: (self.extractors.topics)(state),
            variant: (self.extractors.variant)(state),
            is_first_message: state.is_first_message(),
            user_id: state
                .metadata("user_id")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            session_id: state
                .metadata("session_id")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            metadata: state.request.metadata.clone(),
        }
    }

    /// Builds the prompt context for a state.
    ///
    /// On loader failure the fallback optimizer serves the request if one is
    /// configured; otherwise the error is returned for the calling stage to
    /// surface as a failure.
    pub async fn build(
        &self,
        state: &PipelineState,
        cancel: &CancellationToken,
    ) -> Result<ContextSelection, ContextLoadError> {
        let query = self.derive_query(state);
        let request = SelectionRequest {
            topics: query.topics.clone(),
            is_first_message: query.is_first_message,
            tone: (self.extractors.tone)(state),
        };
        let variant = query.variant.clone();
        let key = variant.clone().unwrap_or_else(|| "default".to_string());

        let loaded = {
            let loader = Arc::clone(&self.loader);
            let cancel = cancel.clone();
            let error_key = key.clone();
            self.cache
                .get_or_load(&key, move || {
                    async move {
                        loader
                            .load(&query, &cancel)
                            .await
                            .map_err(|error| CacheError::load_failed(error_key, error.to_string()))
                    }
                    .boxed()
                })
                .await
        };

        let sections = match loaded {
            Ok(sections) => sections,
            Err(error) => {
                let Some(fallback) = &self.fallback else {
                    return Err(ContextLoadError::Backend(error.to_string()));
                };
                warn!(%error, "context load failed, serving fallback catalog");
                let mut selection =
                    select_sections(fallback.sections(), fallback.policy(), &self.tone_map, &request);
                selection.variant = variant;
                return Ok(selection);
            }
        };

        let mut selection = select_sections(&sections, &self.policy, &self.tone_map, &request);
        selection.variant = variant;
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChatRequest, Message};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedLoader {
        catalogs: HashMap<String, Vec<ContextSection>>,
        loads: AtomicUsize,
    }

    impl ScriptedLoader {
        fn new() -> Self {
            let mut catalogs = HashMap::new();
            catalogs.insert(
                "default".to_string(),
                vec![
                    ContextSection::new("core", "A").always_include(),
                    ContextSection::new("help", "B").with_topics(["help"]),
                ],
            );
            catalogs.insert(
                "experiment".to_string(),
                vec![ContextSection::new("core", "X").always_include()],
            );
            Self {
                catalogs,
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContextLoader for ScriptedLoader {
        async fn load(
            &self,
            query: &LoaderQuery,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ContextSection>, ContextLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let key = query.variant.as_deref().unwrap_or("default");
            self.catalogs
                .get(key)
                .cloned()
                .ok_or_else(|| ContextLoadError::UnknownVariant(key.to_string()))
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl ContextLoader for FailingLoader {
        async fn load(
            &self,
            _query: &LoaderQuery,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ContextSection>, ContextLoadError> {
            Err(ContextLoadError::Backend("connection refused".to_string()))
        }
    }

    fn state_with_metadata(entries: &[(&str, JsonValue)]) -> PipelineState {
        let mut request = ChatRequest::new(vec![Message::user("hello")]);
        for (key, value) in entries {
            request = request.with_metadata(*key, value.clone());
        }
        PipelineState::new(request)
    }

    #[tokio::test]
    async fn test_build_selects_from_loaded_catalog() {
        let loader = Arc::new(ScriptedLoader::new());
        let engine = DynamicContextEngine::new(
            Arc::clone(&loader) as Arc<dyn ContextLoader>,
            Duration::from_secs(60),
        )
        .with_policy(ContextPolicy::selective());

        let state = state_with_metadata(&[("topics", json!(["help"]))]);
        let selection = engine.build(&state, &CancellationToken::new()).await.unwrap();

        assert_eq!(selection.sections_included, vec!["core", "help"]);
        assert_eq!(selection.system_prompt, "A\n\nB");
        assert!(selection.variant.is_none());
    }

    #[tokio::test]
    async fn test_catalog_cached_per_variant() {
        let loader = Arc::new(ScriptedLoader::new());
        let engine = DynamicContextEngine::new(
            Arc::clone(&loader) as Arc<dyn ContextLoader>,
            Duration::from_secs(60),
        );

        let default_state = state_with_metadata(&[]);
        let variant_state = state_with_metadata(&[("context_variant", json!("experiment"))]);

        engine.build(&default_state, &CancellationToken::new()).await.unwrap();
        engine.build(&default_state, &CancellationToken::new()).await.unwrap();
        let experiment = engine
            .build(&variant_state, &CancellationToken::new())
            .await
            .unwrap();

        // One load per variant, not per call.
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(experiment.variant.as_deref(), Some("experiment"));
        assert_eq!(experiment.system_prompt, "X");
    }

    #[tokio::test]
    async fn test_topics_do_not_fragment_the_cache() {
        let loader = Arc::new(ScriptedLoader::new());
        let engine = DynamicContextEngine::new(
            Arc::clone(&loader) as Arc<dyn ContextLoader>,
            Duration::from_secs(60),
        )
        .with_policy(ContextPolicy::selective());

        let with_help = state_with_metadata(&[("topics", json!(["help"]))]);
        let without = state_with_metadata(&[]);

        let first = engine.build(&with_help, &CancellationToken::new()).await.unwrap();
        let second = engine.build(&without, &CancellationToken::new()).await.unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(first.sections_included, vec!["core", "help"]);
        assert_eq!(second.sections_included, vec!["core"]);
    }

    #[tokio::test]
    async fn test_fallback_serves_on_loader_failure() {
        let fallback = ContextOptimizer::new(vec![
            ContextSection::new("static", "S").always_include(),
        ])
        .with_policy(ContextPolicy::selective());

        let engine = DynamicContextEngine::new(Arc::new(FailingLoader), Duration::from_secs(60))
            .with_tone("friendly", "T")
            .with_fallback(fallback);

        let state = state_with_metadata(&[("topics", json!(["anything"]))]);
        let selection = engine.build(&state, &CancellationToken::new()).await.unwrap();

        assert_eq!(selection.sections_included, vec!["static"]);
        assert_eq!(selection.system_prompt, "S");
    }

    #[tokio::test]
    async fn test_loader_failure_without_fallback_errors() {
        let engine = DynamicContextEngine::new(Arc::new(FailingLoader), Duration::from_secs(60));
        let state = state_with_metadata(&[]);

        let result = engine.build(&state, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ContextLoadError::Backend(_))));
    }
}
