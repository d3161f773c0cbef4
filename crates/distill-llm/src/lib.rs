//! Distill LLM orchestration
//!
//! Dispatches structured extraction tasks to a text-generation provider and
//! absorbs its flakiness:
//! - Primary single-shot attempt, then a fallback model with a full retry budget
//! - Per-model rate limiting
//! - Context caching with single-flight creation and a persisted handle map
//! - JSON extraction and repair of model output
//!
//! Callers always receive an [`OrchestrationOutcome`]; only configuration
//! errors surface as [`LLMError`] at construction time.

// Re-export core types
pub use client::{CacheBackend, GenerativeBackend, UsageMetadata};
pub use config::{CacheConfig, OrchestratorConfig, RateLimitConfig, RateLimitScope, RetryConfig};
pub use error::{LLMError, Result};
pub use orchestrator::{Orchestrator, Registry};
pub use retry::ErrorClass;
pub use task::{
    FailureReason, FewShotExample, GenerationParameters, ModelTreatment, OrchestrationOutcome, ResponseFormat,
    TaskRequest,
};

// Re-export providers
pub use provider::{GeminiProvider, MockProvider};

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod preparer;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod task;
pub mod validator;
