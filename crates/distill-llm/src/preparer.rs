//! Request preparation
//!
//! A phase resolves its [`ModelTreatment`] once, and the resulting
//! [`EffectiveParameters`] fix the request shape for every attempt of that
//! phase. Each attempt then passes the rate limiter, picks the cached or the
//! uncached request shape, calls the provider under a timeout and validates
//! the output.

use crate::cache::{CacheManager, CacheRequest};
use crate::client::{Content, GenerateContentRequest, GenerationConfig, GenerativeBackend};
use crate::config::OrchestratorConfig;
use crate::error::{LLMError, Result};
use crate::orchestrator::Registry;
use crate::rate_limit::{Consumption, RateLimiter};
use crate::retry::{AttemptResponse, CallAttempt};
use crate::task::{few_shot_history, FewShotExample, ModelTreatment, ResponseFormat, TaskRequest};
use crate::validator::validate_response;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Instruction block placed before the prompt of tuned models
pub const TUNED_PROMPT_PREFIX: &str = "Extract the requested information from the input below. \
Respond with a single JSON object and nothing else.\n\nInput:\n";

/// Parameters of one phase after treatment resolution
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveParameters {
    pub treatment: ModelTreatment,
    pub generation_config: GenerationConfig,
    /// Sent explicitly on the uncached path, or stored in the cache
    pub system_instruction: Option<String>,
    pub few_shot_examples: Vec<FewShotExample>,
    pub use_cache: bool,
    /// Final user turn
    pub prompt: String,
}

impl EffectiveParameters {
    /// Resolve a task's parameters for `treatment`
    pub fn resolve(task: &TaskRequest, treatment: ModelTreatment, config: &OrchestratorConfig) -> Self {
        let generation = &task.generation;
        let mut generation_config = GenerationConfig {
            temperature: generation.temperature,
            top_p: generation.top_p,
            top_k: generation.top_k,
            max_output_tokens: generation.max_output_tokens,
            response_mime_type: None,
            response_schema: None,
        };

        match treatment {
            ModelTreatment::Tuned => {
                generation_config.response_mime_type = Some(ResponseFormat::Text.mime_type().to_string());
                Self {
                    treatment,
                    generation_config,
                    system_instruction: None,
                    few_shot_examples: Vec::new(),
                    use_cache: false,
                    prompt: format!("{}{}", TUNED_PROMPT_PREFIX, task.prompt),
                }
            }
            ModelTreatment::NonTuned => {
                generation_config.response_mime_type = Some(generation.response_format.mime_type().to_string());
                if generation.response_format == ResponseFormat::Json {
                    generation_config.response_schema = generation.response_schema.clone();
                }
                let few_shot_examples = if config.few_shot_enabled {
                    task.few_shot_examples.clone()
                } else {
                    Vec::new()
                };
                Self {
                    treatment,
                    generation_config,
                    system_instruction: Some(task.system_instruction.trim())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    few_shot_examples,
                    use_cache: task.use_cache && config.cache.enabled,
                    prompt: task.prompt.clone(),
                }
            }
        }
    }
}

/// Builds [`PreparedCall`]s for models
#[derive(Clone)]
pub struct ModelPreparer {
    backend: Arc<dyn GenerativeBackend>,
    registry: Arc<Registry>,
    config: Arc<OrchestratorConfig>,
}

impl ModelPreparer {
    pub fn new(backend: Arc<dyn GenerativeBackend>, registry: Arc<Registry>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    /// Treatment a model gets on its own
    pub fn treatment_for(&self, model: &str) -> ModelTreatment {
        if self.config.is_tuned_model(model) {
            ModelTreatment::Tuned
        } else {
            ModelTreatment::NonTuned
        }
    }

    /// Prepare `task` for `model` under a fixed treatment
    ///
    /// Fails when the backend rejects the model or its rate limiter cannot be
    /// created.
    pub fn prepare(&self, task: &TaskRequest, model: &str, treatment: ModelTreatment) -> Result<PreparedCall> {
        self.backend.check_model(model)?;
        let limiter = self.registry.rate_limiters().acquire(model)?;
        let bucket_key = self
            .registry
            .rate_limiters()
            .bucket_key(model, &task.task_type, task.stream_key.as_deref());

        let params = EffectiveParameters::resolve(task, treatment, &self.config);
        let cache = if params.use_cache {
            let cache = self.registry.cache().cloned();
            if cache.is_none() {
                debug!(model, task_type = %task.task_type, "Caching requested but no cache backend configured");
            }
            cache
        } else {
            None
        };

        debug!(
            model,
            task_type = %task.task_type,
            treatment = %treatment,
            cache = cache.is_some(),
            few_shot = params.few_shot_examples.len(),
            "Prepared model call"
        );

        Ok(PreparedCall {
            task_type: task.task_type.clone(),
            model: model.to_string(),
            params,
            backend: Arc::clone(&self.backend),
            limiter,
            bucket_key,
            cache,
            timeout: self.config.request_timeout(),
        })
    }
}

/// A model call with its request shape fixed
pub struct PreparedCall {
    task_type: String,
    model: String,
    params: EffectiveParameters,
    backend: Arc<dyn GenerativeBackend>,
    limiter: Arc<RateLimiter>,
    bucket_key: String,
    cache: Option<CacheManager>,
    timeout: Duration,
}

impl PreparedCall {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn treatment(&self) -> ModelTreatment {
        self.params.treatment
    }

    pub fn params(&self) -> &EffectiveParameters {
        &self.params
    }

    /// Build the request for the next attempt
    ///
    /// Uses the cached path when a cached context is available, the uncached
    /// path otherwise.
    pub async fn build_request(&self) -> GenerateContentRequest {
        if let Some(cache) = &self.cache {
            let context = cache
                .get_or_create(CacheRequest {
                    task_type: self.task_type.clone(),
                    model: self.model.clone(),
                    system_instruction: self.params.system_instruction.clone().unwrap_or_default(),
                    few_shot_examples: self.params.few_shot_examples.clone(),
                    generation_config: Some(self.params.generation_config.clone()),
                })
                .await;

            if let Some(context) = context {
                return GenerateContentRequest {
                    model: self.model.clone(),
                    contents: vec![Content::user(self.params.prompt.clone())],
                    system_instruction: None,
                    cached_content: Some(context.handle),
                    generation_config: Some(self.params.generation_config.clone()),
                };
            }
            debug!(model = %self.model, task_type = %self.task_type, "Proceeding without cache");
        }

        let mut contents = few_shot_history(&self.params.few_shot_examples);
        contents.push(Content::user(self.params.prompt.clone()));

        GenerateContentRequest {
            model: self.model.clone(),
            contents,
            system_instruction: self.params.system_instruction.as_deref().map(Content::system),
            cached_content: None,
            generation_config: Some(self.params.generation_config.clone()),
        }
    }
}

#[async_trait]
impl CallAttempt for PreparedCall {
    async fn attempt(&self, attempt: u32) -> Result<AttemptResponse> {
        if let Consumption::Wait(wait) = self.limiter.consume(&self.bucket_key) {
            return Err(LLMError::RateLimited { wait });
        }

        let request = self.build_request().await;
        debug!(
            model = %self.model,
            task_type = %self.task_type,
            attempt,
            cached = request.cached_content.is_some(),
            "Calling provider"
        );

        let response = tokio::time::timeout(self.timeout, self.backend.generate_content(&request))
            .await
            .map_err(|_| {
                warn!(model = %self.model, attempt, timeout_secs = self.timeout.as_secs(), "Provider call timed out");
                LLMError::Timeout(self.timeout)
            })??;

        let text = validate_response(&response)?;
        Ok(AttemptResponse {
            text,
            usage: response.usage_metadata,
        })
    }

    async fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&self.task_type, &self.model, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::RateLimitConfig;
    use crate::provider::MockProvider;
    use serde_json::json;

    fn task() -> TaskRequest {
        let mut task = TaskRequest::new("invoice", "gemini-1.5-flash", "Total: 12")
            .with_system_instruction("You extract invoices")
            .with_few_shot(vec![FewShotExample::new("Total: 1", "{\"total\": 1}")])
            .with_cache(true);
        task.generation.response_schema = Some(json!({"type": "object"}));
        task
    }

    fn preparer(provider: Arc<MockProvider>, config: OrchestratorConfig, with_cache: bool) -> ModelPreparer {
        let cache = with_cache.then(|| CacheManager::new(provider.clone(), CacheStore::in_memory(), 3600));
        let registry = Arc::new(Registry::new(config.rate_limit.clone(), cache));
        ModelPreparer::new(provider, registry, Arc::new(config))
    }

    #[test]
    fn test_tuned_parameters() {
        let params = EffectiveParameters::resolve(&task(), ModelTreatment::Tuned, &OrchestratorConfig::default());

        assert_eq!(params.generation_config.response_mime_type.as_deref(), Some("text/plain"));
        assert!(params.generation_config.response_schema.is_none());
        assert!(params.system_instruction.is_none());
        assert!(params.few_shot_examples.is_empty());
        assert!(!params.use_cache);
        assert!(params.prompt.starts_with(TUNED_PROMPT_PREFIX));
        assert!(params.prompt.ends_with("Total: 12"));
    }

    #[test]
    fn test_non_tuned_parameters() {
        let params = EffectiveParameters::resolve(&task(), ModelTreatment::NonTuned, &OrchestratorConfig::default());

        assert_eq!(params.generation_config.response_mime_type.as_deref(), Some("application/json"));
        assert_eq!(params.generation_config.response_schema, Some(json!({"type": "object"})));
        assert_eq!(params.system_instruction.as_deref(), Some("You extract invoices"));
        assert_eq!(params.few_shot_examples.len(), 1);
        assert!(params.use_cache);
        assert_eq!(params.prompt, "Total: 12");
    }

    #[test]
    fn test_non_tuned_flags_disable_few_shot_and_cache() {
        let mut config = OrchestratorConfig::default();
        config.few_shot_enabled = false;
        config.cache.enabled = false;

        let params = EffectiveParameters::resolve(&task(), ModelTreatment::NonTuned, &config);
        assert!(params.few_shot_examples.is_empty());
        assert!(!params.use_cache);
    }

    #[tokio::test]
    async fn test_uncached_request_shape() {
        let provider = Arc::new(MockProvider::new());
        let preparer = preparer(provider, OrchestratorConfig::default(), false);

        let call = preparer
            .prepare(&task(), "gemini-1.5-flash", ModelTreatment::NonTuned)
            .unwrap();
        let request = call.build_request().await;

        assert!(request.cached_content.is_none());
        assert_eq!(request.system_instruction.unwrap().text(), "You extract invoices");
        let roles: Vec<_> = request.contents.iter().map(|c| c.role.clone().unwrap()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(request.contents[2].text(), "Total: 12");
    }

    #[tokio::test]
    async fn test_cached_request_shape() {
        let provider = Arc::new(MockProvider::new());
        let preparer = preparer(provider.clone(), OrchestratorConfig::default(), true);

        let call = preparer
            .prepare(&task(), "gemini-1.5-flash", ModelTreatment::NonTuned)
            .unwrap();
        let request = call.build_request().await;

        assert_eq!(request.cached_content.as_deref(), Some("cachedContents/mock-1"));
        assert!(request.system_instruction.is_none());
        assert_eq!(request.contents, vec![Content::user("Total: 12")]);
        assert_eq!(provider.cache_creations(), 1);
    }

    #[tokio::test]
    async fn test_failed_cache_creation_falls_back_to_uncached() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_next_cache_creation("RESOURCE_EXHAUSTED");
        let preparer = preparer(provider, OrchestratorConfig::default(), true);

        let call = preparer
            .prepare(&task(), "gemini-1.5-flash", ModelTreatment::NonTuned)
            .unwrap();
        let request = call.build_request().await;

        assert!(request.cached_content.is_none());
        assert!(request.system_instruction.is_some());
        assert_eq!(request.contents.len(), 3);
    }

    #[tokio::test]
    async fn test_tuned_request_skips_cache() {
        let provider = Arc::new(MockProvider::new());
        let preparer = preparer(provider.clone(), OrchestratorConfig::default(), true);

        let call = preparer
            .prepare(&task(), "tunedModels/invoice-1", ModelTreatment::Tuned)
            .unwrap();
        let request = call.build_request().await;

        assert!(request.cached_content.is_none());
        assert!(request.system_instruction.is_none());
        assert_eq!(request.contents.len(), 1);
        assert_eq!(provider.cache_creations(), 0);
        assert_eq!(preparer.treatment_for("tunedModels/invoice-1"), ModelTreatment::Tuned);
    }

    #[test]
    fn test_prepare_rejects_unknown_model() {
        let provider = Arc::new(MockProvider::new());
        provider.reject_model("nope");
        let preparer = preparer(provider, OrchestratorConfig::default(), false);

        assert!(matches!(
            preparer.prepare(&task(), "nope", ModelTreatment::NonTuned),
            Err(LLMError::Preparation(_))
        ));
    }

    #[test]
    fn test_prepare_propagates_limiter_failure() {
        let mut config = OrchestratorConfig::default();
        config.rate_limit = RateLimitConfig {
            points: 0,
            ..Default::default()
        };
        let preparer = preparer(Arc::new(MockProvider::new()), config, false);

        assert!(matches!(
            preparer.prepare(&task(), "gemini-1.5-flash", ModelTreatment::NonTuned),
            Err(LLMError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_reports_rate_limit_wait() {
        let mut config = OrchestratorConfig::default();
        config.rate_limit.points = 1;
        let preparer = preparer(Arc::new(MockProvider::new()), config, false);
        let call = preparer
            .prepare(&task(), "gemini-1.5-flash", ModelTreatment::NonTuned)
            .unwrap();

        let response = call.attempt(1).await.unwrap();
        assert_eq!(response.text, r#"{"result": "mock"}"#);
        assert!(response.usage.is_some());

        assert!(matches!(call.attempt(2).await, Err(LLMError::RateLimited { .. })));
    }
}
