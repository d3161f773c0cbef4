//! Two-phase orchestration
//!
//! A task first runs once against its primary model. If that single attempt
//! fails (or there is no primary), the fallback model runs with the full retry
//! budget. A tuned primary hands over to a non-tuned fallback.

use crate::cache::{CacheManager, CacheStore};
use crate::client::{CacheBackend, GenerativeBackend};
use crate::config::{OrchestratorConfig, RateLimitConfig};
use crate::error::Result;
use crate::preparer::ModelPreparer;
use crate::rate_limit::RateLimiterRegistry;
use crate::retry::{self, ErrorClass, RetryOutcome, RetryPolicy};
use crate::task::{FailureReason, ModelTreatment, OrchestrationOutcome, TaskRequest};
use crate::validator::clean_json_output;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Shared state of one orchestration root
///
/// Owns the per-model rate limiters and the cache manager. Every component
/// receives it by reference, so independent roots (or tests) never share
/// limiter buckets or cached handles.
pub struct Registry {
    rate_limiters: RateLimiterRegistry,
    cache: Option<CacheManager>,
}

impl Registry {
    pub fn new(rate_limit: RateLimitConfig, cache: Option<CacheManager>) -> Self {
        Self {
            rate_limiters: RateLimiterRegistry::new(rate_limit),
            cache,
        }
    }

    pub fn rate_limiters(&self) -> &RateLimiterRegistry {
        &self.rate_limiters
    }

    /// Cache manager, when context caching is available
    pub fn cache(&self) -> Option<&CacheManager> {
        self.cache.as_ref()
    }
}

/// How one phase ended
struct PhaseResult {
    model: String,
    treatment: ModelTreatment,
    outcome: std::result::Result<RetryOutcome, String>,
}

impl PhaseResult {
    fn into_outcome(self, used_fallback: bool, elapsed: std::time::Duration) -> OrchestrationOutcome {
        let (reason, class, detail, attempts) = match self.outcome {
            Ok(RetryOutcome::Success { response, attempts, .. }) => {
                return OrchestrationOutcome {
                    response_text: clean_json_output(&response.text),
                    usage: response.usage,
                    success: true,
                    used_fallback,
                    model_used: Some(self.model),
                    treatment: Some(self.treatment),
                    failure_reason: None,
                    failure_class: None,
                    failure_detail: None,
                    attempts,
                    elapsed,
                };
            }
            Ok(RetryOutcome::Failed {
                reason,
                class,
                attempts,
                detail,
            }) => (reason, Some(class), detail, attempts),
            Err(detail) => (FailureReason::PreparationFailed, Some(ErrorClass::Configuration), detail, 0),
        };

        OrchestrationOutcome {
            used_fallback,
            model_used: Some(self.model),
            treatment: Some(self.treatment),
            attempts,
            failure_class: class,
            ..OrchestrationOutcome::failure(reason, Some(detail), elapsed)
        }
    }
}

/// Primary/fallback orchestrator
pub struct Orchestrator {
    preparer: ModelPreparer,
    registry: Arc<Registry>,
    policy: RetryPolicy,
}

impl Orchestrator {
    /// Create an orchestrator over an explicit registry
    pub fn new(backend: Arc<dyn GenerativeBackend>, registry: Registry, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        let policy = RetryPolicy::from_config(&config.retry);
        let preparer = ModelPreparer::new(backend, Arc::clone(&registry), Arc::new(config));

        Ok(Self {
            preparer,
            registry,
            policy,
        })
    }

    /// Create an orchestrator with a fresh registry
    ///
    /// Context caching is enabled when a cache backend is given and the
    /// configuration allows it; the persisted handle map is loaded from
    /// `cache.store_path` if set.
    pub async fn build(
        backend: Arc<dyn GenerativeBackend>,
        cache_backend: Option<Arc<dyn CacheBackend>>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;

        let cache = match cache_backend {
            Some(cache_backend) if config.cache.enabled => {
                let store = match &config.cache.store_path {
                    Some(path) => CacheStore::open(path).await?,
                    None => CacheStore::in_memory(),
                };
                info!(entries = store.snapshot().await.len(), "Context cache enabled");
                Some(CacheManager::new(cache_backend, store, config.cache.ttl_seconds))
            }
            _ => None,
        };

        let registry = Registry::new(config.rate_limit.clone(), cache);
        Self::new(backend, registry, config)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run a task through the primary and, if needed, the fallback model
    ///
    /// Never fails: every error ends up in the returned outcome.
    pub async fn run(&self, task: &TaskRequest) -> OrchestrationOutcome {
        let started = Instant::now();
        let primary = non_empty(task.model_name.as_deref());
        let fallback = non_empty(task.fallback_model_name.as_deref());

        let mut primary_result = None;
        if let Some(model) = primary {
            let treatment = self.preparer.treatment_for(model);
            info!(task_type = %task.task_type, model, treatment = %treatment, "Running primary model");

            let result = self.run_phase(task, model, treatment, &self.policy.single_shot()).await;
            if matches!(result.outcome, Ok(RetryOutcome::Success { .. })) {
                return result.into_outcome(false, started.elapsed());
            }
            primary_result = Some(result);
        }

        let Some(fallback) = fallback else {
            return match primary_result {
                Some(result) => {
                    error!(task_type = %task.task_type, "Primary model failed and no fallback is configured");
                    result.into_outcome(false, started.elapsed())
                }
                None => {
                    error!(task_type = %task.task_type, "No model configured");
                    OrchestrationOutcome::failure(
                        FailureReason::NoPrimaryModel,
                        Some("Neither a primary nor a fallback model is configured".to_string()),
                        started.elapsed(),
                    )
                }
            };
        };

        let treatment = match &primary_result {
            Some(result) if result.treatment == ModelTreatment::Tuned => ModelTreatment::NonTuned,
            Some(result) => result.treatment,
            None => self.preparer.treatment_for(fallback),
        };
        warn!(
            task_type = %task.task_type,
            primary = primary.unwrap_or("<none>"),
            fallback,
            treatment = %treatment,
            "Switching to fallback model"
        );

        self.run_phase(task, fallback, treatment, &self.policy)
            .await
            .into_outcome(true, started.elapsed())
    }

    async fn run_phase(
        &self,
        task: &TaskRequest,
        model: &str,
        treatment: ModelTreatment,
        policy: &RetryPolicy,
    ) -> PhaseResult {
        let outcome = match self.preparer.prepare(task, model, treatment) {
            Ok(call) => Ok(retry::execute(&call, policy).await),
            Err(e) => {
                error!(task_type = %task.task_type, model, error = %e, "Failed to prepare model");
                Err(e.to_string())
            }
        };

        PhaseResult {
            model: model.to_string(),
            treatment,
            outcome,
        }
    }
}

fn non_empty(model: Option<&str>) -> Option<&str> {
    model.map(str::trim).filter(|m| !m.is_empty())
}
