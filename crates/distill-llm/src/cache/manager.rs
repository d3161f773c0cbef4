//! Cached context manager
//!
//! Maps `(task type, model)` to a remote cached context holding the system
//! instruction and few-shot history. At most one retrieval/creation runs per
//! key; concurrent callers for the same key await that operation.

use crate::cache::store::CacheStore;
use crate::client::{CacheBackend, CachedContentRequest, Content, GenerationConfig};
use crate::task::{few_shot_history, FewShotExample};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tracing::{debug, info, warn};

type InFlight = Shared<BoxFuture<'static, Option<CachedContext>>>;

/// Cache key for a task type and model
pub fn cache_key(task_type: &str, model: &str) -> String {
    format!("{}:{}", task_type, model)
}

/// A usable remote cached context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContext {
    /// Key this context is stored under
    pub cache_key: String,
    /// Remote handle, e.g. `cachedContents/abc123`
    pub handle: String,
    /// When this process created or re-validated the handle
    pub created_at: DateTime<Utc>,
}

/// Static context to cache for a task type and model
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub task_type: String,
    pub model: String,
    pub system_instruction: String,
    pub few_shot_examples: Vec<FewShotExample>,
    pub generation_config: Option<GenerationConfig>,
}

impl CacheRequest {
    /// Key of the context this request describes
    pub fn key(&self) -> String {
        cache_key(&self.task_type, &self.model)
    }
}

struct CacheInner {
    backend: Arc<dyn CacheBackend>,
    store: CacheStore,
    memory: DashMap<String, CachedContext>,
    in_flight: DashMap<String, InFlight>,
    ttl_seconds: u64,
}

/// Single-flight get-or-create of cached contexts
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl CacheManager {
    /// Create a manager over a cache backend and a persisted store
    pub fn new(backend: Arc<dyn CacheBackend>, store: CacheStore, ttl_seconds: u64) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                store,
                memory: DashMap::new(),
                in_flight: DashMap::new(),
                ttl_seconds,
            }),
        }
    }

    /// Return a usable cached context for the request, creating one if needed
    ///
    /// `None` means "proceed without cache": caching never fails the call.
    pub async fn get_or_create(&self, request: CacheRequest) -> Option<CachedContext> {
        let key = request.key();

        if let Some(context) = self.inner.memory_hit(&key) {
            debug!(cache_key = %key, "Cache hit");
            return Some(context);
        }

        let operation = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(cache_key = %key, "Joining in-flight cache operation");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let inner = Arc::clone(&self.inner);
                let task_key = key.clone();
                let handle = tokio::spawn(async move { inner.resolve(task_key, request).await });
                let operation = async move {
                    handle.await.unwrap_or_else(|e| {
                        warn!(error = %e, "Cache operation task failed");
                        None
                    })
                }
                .boxed()
                .shared();
                entry.insert(operation.clone());
                operation
            }
        };

        operation.await
    }

    /// Drop the context for `(task_type, model)`
    ///
    /// With `persistently`, the durable entry is removed and the map flushed.
    pub async fn invalidate(&self, task_type: &str, model: &str, persistently: bool) {
        let key = cache_key(task_type, model);
        self.inner.memory.remove(&key);
        info!(cache_key = %key, persistently, "Invalidated cached context");

        if persistently {
            if let Err(e) = self.inner.store.remove(&key).await {
                warn!(cache_key = %key, error = %e, "Failed to persist cache invalidation");
            }
        }
    }

    /// In-memory context for `(task_type, model)`, without any I/O
    pub fn cached(&self, task_type: &str, model: &str) -> Option<CachedContext> {
        self.inner.memory_hit(&cache_key(task_type, model))
    }

    /// The persisted store
    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }
}

impl CacheInner {
    fn memory_hit(&self, key: &str) -> Option<CachedContext> {
        self.memory
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|context| !context.handle.is_empty())
    }

    /// Body of one in-flight operation; unregisters itself when done
    async fn resolve(self: Arc<Self>, key: String, request: CacheRequest) -> Option<CachedContext> {
        let result = self.retrieve_or_create(&key, &request).await;
        self.in_flight.remove(&key);
        result
    }

    async fn retrieve_or_create(&self, key: &str, request: &CacheRequest) -> Option<CachedContext> {
        // an operation that finished between the caller's miss and our registration
        if let Some(context) = self.memory_hit(key) {
            debug!(cache_key = %key, "Cache filled before operation started");
            return Some(context);
        }

        if let Some(handle) = self.store.get(key).await {
            match self.backend.get_cached_content(&handle).await {
                Ok(Some(_)) => {
                    let context = self.remember(key, handle);
                    info!(cache_key = %key, handle = %context.handle, "Reusing persisted cached context");
                    return Some(context);
                }
                Ok(None) => {
                    warn!(cache_key = %key, handle = %handle, "Persisted cached context not found, purging");
                }
                Err(e) => {
                    warn!(cache_key = %key, handle = %handle, error = %e, "Persisted cached context lookup failed, purging");
                }
            }
            self.purge(key).await;
        }

        // a concurrent invalidate-and-create may have finished meanwhile
        if let Some(context) = self.memory_hit(key) {
            return Some(context);
        }

        let contents = few_shot_history(&request.few_shot_examples);
        let system_instruction = Some(request.system_instruction.trim())
            .filter(|s| !s.is_empty())
            .map(Content::system);

        if contents.is_empty() && system_instruction.is_none() {
            debug!(cache_key = %key, "Nothing to cache");
            return None;
        }

        let create = CachedContentRequest {
            model: request.model.clone(),
            display_name: format!(
                "{}-{}-{}",
                request.task_type,
                request.model.replace('/', "_"),
                Utc::now().timestamp_millis()
            ),
            contents,
            system_instruction,
            generation_config: request.generation_config.clone(),
            ttl_seconds: self.ttl_seconds,
        };

        match self.backend.create_cached_content(&create).await {
            Ok(created) if !created.name.is_empty() => {
                let context = self.remember(key, created.name);
                if let Err(e) = self.store.insert(key, &context.handle).await {
                    warn!(cache_key = %key, error = %e, "Failed to persist cached context handle");
                }
                info!(
                    cache_key = %key,
                    handle = %context.handle,
                    display_name = %create.display_name,
                    "Created cached context"
                );
                Some(context)
            }
            Ok(_) => {
                warn!(cache_key = %key, "Provider returned a cached context without a handle");
                None
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Cached context creation failed, continuing without cache");
                None
            }
        }
    }

    fn remember(&self, key: &str, handle: String) -> CachedContext {
        let context = CachedContext {
            cache_key: key.to_string(),
            handle,
            created_at: Utc::now(),
        };
        self.memory.insert(key.to_string(), context.clone());
        context
    }

    /// Remove `key` from both maps
    async fn purge(&self, key: &str) {
        self.memory.remove(key);
        if let Err(e) = self.store.remove(key).await {
            warn!(cache_key = %key, error = %e, "Failed to persist cache purge");
        }
    }
}
