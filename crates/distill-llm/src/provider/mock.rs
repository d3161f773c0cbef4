//! Mock provider for testing
//!
//! Replays scripted replies per model and keeps an in-process registry of
//! cached contexts, so orchestration can be exercised without a network.

use crate::client::{
    CacheBackend, CachedContent, CachedContentRequest, GenerateContentRequest, GenerateContentResponse,
    GenerativeBackend, UsageMetadata,
};
use crate::error::{LLMError, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Reply = Result<GenerateContentResponse>;

/// Mock provider for testing
pub struct MockProvider {
    name: String,
    default_response: String,
    scripts: DashMap<String, VecDeque<Reply>>,
    requests: Mutex<Vec<GenerateContentRequest>>,
    rejected_models: DashSet<String>,
    caches: DashMap<String, CachedContent>,
    cache_requests: Mutex<Vec<CachedContentRequest>>,
    cache_creations: AtomicUsize,
    cache_failures: Mutex<VecDeque<String>>,
    cache_delay: Option<Duration>,
    generate_delay: Option<Duration>,
}

impl MockProvider {
    /// Create a new mock provider
    pub fn new() -> Self {
        Self::with_response(r#"{"result": "mock"}"#.to_string())
    }

    /// Create with custom default response
    pub fn with_response(response: String) -> Self {
        Self {
            name: "mock".to_string(),
            default_response: response,
            scripts: DashMap::new(),
            requests: Mutex::new(Vec::new()),
            rejected_models: DashSet::new(),
            caches: DashMap::new(),
            cache_requests: Mutex::new(Vec::new()),
            cache_creations: AtomicUsize::new(0),
            cache_failures: Mutex::new(VecDeque::new()),
            cache_delay: None,
            generate_delay: None,
        }
    }

    /// Delay every cache creation, to widen concurrency windows
    pub fn with_cache_delay(mut self, delay: Duration) -> Self {
        self.cache_delay = Some(delay);
        self
    }

    /// Delay every generate call, to exercise timeouts
    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = Some(delay);
        self
    }

    /// Queue a reply for the next call to `model`
    pub fn push_reply(&self, model: &str, reply: Reply) {
        self.scripts.entry(model.to_string()).or_default().push_back(reply);
    }

    /// Queue a text reply with usage metadata
    pub fn push_text(&self, model: &str, text: &str) {
        self.push_reply(model, Ok(Self::text_response(text)));
    }

    /// Queue a provider error
    pub fn push_error(&self, model: &str, status: Option<u16>, message: &str) {
        self.push_reply(model, Err(LLMError::provider(status, message)));
    }

    /// Make `check_model` fail for `model`
    pub fn reject_model(&self, model: &str) {
        self.rejected_models.insert(model.to_string());
    }

    /// Register a cached context as existing remotely
    pub fn register_cached_content(&self, name: &str) {
        self.caches.insert(
            name.to_string(),
            CachedContent {
                name: name.to_string(),
                ..Default::default()
            },
        );
    }

    /// Forget a cached context, as if it expired remotely
    pub fn expire_cached_content(&self, name: &str) {
        self.caches.remove(name);
    }

    /// Make the next cache creation fail
    pub fn fail_next_cache_creation(&self, message: &str) {
        if let Ok(mut failures) = self.cache_failures.lock() {
            failures.push_back(message.to_string());
        }
    }

    /// Number of cache creation calls received
    pub fn cache_creations(&self) -> usize {
        self.cache_creations.load(Ordering::SeqCst)
    }

    /// Cache creation requests received
    pub fn cache_requests(&self) -> Vec<CachedContentRequest> {
        self.cache_requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Generate requests received
    pub fn requests(&self) -> Vec<GenerateContentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of generate calls to `model`
    pub fn calls_to(&self, model: &str) -> usize {
        self.requests().iter().filter(|r| r.model == model).count()
    }

    fn text_response(text: &str) -> GenerateContentResponse {
        GenerateContentResponse::from_text(text).with_usage(UsageMetadata {
            prompt_token_count: 10,
            candidates_token_count: 5,
            cached_content_token_count: 0,
            total_token_count: 15,
        })
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerativeBackend for MockProvider {
    async fn generate_content(&self, request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(delay) = self.generate_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(handle) = &request.cached_content {
            if !self.caches.contains_key(handle) {
                return Err(LLMError::provider(
                    Some(404),
                    format!("NOT_FOUND: CachedContent not found: {}", handle),
                ));
            }
        }

        let scripted = self
            .scripts
            .get_mut(&request.model)
            .and_then(|mut queue| queue.pop_front());

        match scripted {
            Some(reply) => reply,
            None => Ok(Self::text_response(&self.default_response)),
        }
    }

    fn check_model(&self, model: &str) -> Result<()> {
        if model.trim().is_empty() || self.rejected_models.contains(model) {
            return Err(LLMError::Preparation(format!("Unknown model '{}'", model)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl CacheBackend for MockProvider {
    async fn create_cached_content(&self, request: &CachedContentRequest) -> Result<CachedContent> {
        let index = self.cache_creations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut requests) = self.cache_requests.lock() {
            requests.push(request.clone());
        }

        if let Some(delay) = self.cache_delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.cache_failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(message) = failure {
            return Err(LLMError::provider(Some(429), message));
        }

        let created = CachedContent {
            name: format!("cachedContents/mock-{}", index),
            model: Some(request.model.clone()),
            display_name: Some(request.display_name.clone()),
            expire_time: None,
        };
        self.caches.insert(created.name.clone(), created.clone());
        Ok(created)
    }

    async fn get_cached_content(&self, name: &str) -> Result<Option<CachedContent>> {
        Ok(self.caches.get(name).map(|c| c.value().clone()))
    }
}
