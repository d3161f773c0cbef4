//! Orchestration configuration

use crate::error::{LLMError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry and backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt budget of the fallback phase
    pub max_attempts: u32,
    /// First backoff delay
    pub initial_delay_ms: u64,
    /// Backoff ceiling
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each wait
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 500,
        }
    }
}

/// Which logical streams share a limiter bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    /// One bucket per model, shared by every task
    #[default]
    Model,
    /// One bucket per (model, task type, stream key)
    Stream,
}

/// Default limiter parameters, applied to every model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Consumptions allowed per window
    pub points: u32,
    /// Window length
    pub window_seconds: u64,
    /// Block applied once a bucket is exhausted
    pub block_seconds: u64,
    /// Bucket key policy
    pub scope: RateLimitScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 10,
            window_seconds: 60,
            block_seconds: 60,
            scope: RateLimitScope::Model,
        }
    }
}

/// Context cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; tasks still opt in with `use_cache`
    pub enabled: bool,
    /// TTL of created caches
    pub ttl_seconds: u64,
    /// JSON file holding the persisted key → handle map
    pub store_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            store_path: None,
        }
    }
}

/// Top-level orchestration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,

    /// Timeout of one provider call
    pub request_timeout_secs: u64,

    /// Send few-shot history to non-tuned models
    pub few_shot_enabled: bool,

    /// Models whose name starts with this prefix are tuned
    pub tuned_model_prefix: String,

    /// Additional tuned model names
    pub tuned_models: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            request_timeout_secs: 300,
            few_shot_enabled: true,
            tuned_model_prefix: "tunedModels/".to_string(),
            tuned_models: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Provider call timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Whether `model` is a tuned model
    pub fn is_tuned_model(&self, model: &str) -> bool {
        (!self.tuned_model_prefix.is_empty() && model.starts_with(&self.tuned_model_prefix))
            || self.tuned_models.iter().any(|m| m == model)
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(LLMError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(LLMError::InvalidConfiguration(format!(
                "retry.max_delay_ms ({}) is below retry.initial_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.initial_delay_ms
            )));
        }
        if self.rate_limit.points == 0 || self.rate_limit.window_seconds == 0 {
            return Err(LLMError::InvalidConfiguration(
                "rate_limit.points and rate_limit.window_seconds must be positive".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(LLMError::InvalidConfiguration(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
