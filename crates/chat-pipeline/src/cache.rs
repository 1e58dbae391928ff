//! Keyed TTL cache with single-flight load coalescing.
//!
//! [`TtlCache`] backs the dynamic context engine: loaded values live until
//! their per-key expiry, and concurrent misses on the same key share one
//! in-flight load instead of stampeding the backend. Expired entries are not
//! swept proactively; the next load overwrites them.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

/// Errors surfaced by cache loads.
///
/// `Clone` so that every caller coalesced onto a single in-flight load
/// observes the same failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The loader for a key failed; nothing was written to the cache.
    #[error("cache load failed for key '{key}': {reason}")]
    LoadFailed { key: String, reason: String },
}

impl CacheError {
    /// Creates a load failure for `key`.
    pub fn load_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    pending: HashMap<String, SharedLoad<T>>,
}

/// A keyed cache with per-entry TTL and single-flight coalescing.
///
/// Cheap to clone; clones share the same storage.
pub struct TtlCache<T> {
    inner: Arc<Mutex<CacheInner<T>>>,
    ttl: Duration,
}

impl<T> Clone for TtlCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
        }
    }
}

impl<T> TtlCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose entries expire `ttl` after being loaded.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                pending: HashMap::new(),
            })),
            ttl,
        }
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `key`, loading it if absent or expired.
    ///
    /// Concurrent callers that miss on the same key join the first caller's
    /// in-flight load: the loader runs exactly once and every waiter
    /// receives the same result. A failed load writes nothing; all waiters
    /// observe the error and the next call starts a fresh load.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let shared = {
            let mut inner = self.inner.lock().await;

            if let Some(entry) = inner.entries.get(key) {
                if entry.expires_at > Instant::now() {
                    trace!(key, "cache hit");
                    return Ok(entry.value.clone());
                }
            }

            if let Some(pending) = inner.pending.get(key) {
                trace!(key, "joining in-flight load");
                pending.clone()
            } else {
                debug!(key, "cache miss, starting load");
                let fut = loader();
                let storage = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                let ttl = self.ttl;
                let load: BoxFuture<'static, Result<T, CacheError>> = Box::pin(async move {
                    let result = fut.await;
                    let mut inner = storage.lock().await;
                    inner.pending.remove(&owned_key);
                    if let Ok(value) = &result {
                        inner.entries.insert(
                            owned_key,
                            CacheEntry {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                    }
                    result
                });
                let shared = load.shared();
                inner.pending.insert(key.to_string(), shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Drops the cached entry for `key`, if any.
    pub async fn invalidate(&self, key: &str) {
        self.inner.lock().await.entries.remove(key);
    }

    /// Drops every cached entry.
    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }

    /// Number of stored entries, expired ones included.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}
