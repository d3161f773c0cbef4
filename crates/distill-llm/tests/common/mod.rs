//! Common test utilities for orchestration integration tests

#![allow(dead_code)]

use distill_llm::client::{GenerateContentResponse, PromptFeedback};
use distill_llm::{CacheBackend, FewShotExample, MockProvider, Orchestrator, OrchestratorConfig, TaskRequest};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds orchestrators over a shared scripted provider
pub struct TestHarness {
    pub provider: Arc<MockProvider>,
    config: OrchestratorConfig,
}

impl TestHarness {
    /// Harness with default config and jitter disabled
    pub fn new() -> Self {
        Self::with_provider(MockProvider::new())
    }

    pub fn with_provider(provider: MockProvider) -> Self {
        let mut config = OrchestratorConfig::default();
        config.retry.jitter_ms = 0;
        Self {
            provider: Arc::new(provider),
            config,
        }
    }

    /// Adjust the configuration before building
    pub fn configure(mut self, f: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Persist cache handles to `path`
    pub fn with_store(self, path: PathBuf) -> Self {
        self.configure(|c| c.cache.store_path = Some(path))
    }

    pub async fn build(&self) -> Orchestrator {
        let cache_backend: Arc<dyn CacheBackend> = self.provider.clone();
        Orchestrator::build(self.provider.clone(), Some(cache_backend), self.config.clone())
            .await
            .expect("Failed to build orchestrator")
    }
}

/// An invoice task with system instruction, few-shot pairs and caching on
pub fn invoice_task(model: Option<&str>, fallback: Option<&str>) -> TaskRequest {
    let mut task = TaskRequest::new("invoice", "", "Invoice #7: total 12.50 EUR")
        .with_model(model.map(str::to_string))
        .with_system_instruction("Extract invoice fields as JSON")
        .with_few_shot(vec![
            FewShotExample::new("Invoice #1: total 3 USD", r#"{"number": 1, "total": 3, "currency": "USD"}"#),
            FewShotExample::new("Invoice #2: total 9 EUR", r#"{"number": 2, "total": 9, "currency": "EUR"}"#),
        ])
        .with_cache(true);
    if let Some(fallback) = fallback {
        task = task.with_fallback(fallback);
    }
    task
}

/// A response withheld by safety filters
pub fn blocked_response() -> GenerateContentResponse {
    GenerateContentResponse {
        prompt_feedback: Some(PromptFeedback {
            block_reason: Some("SAFETY".to_string()),
            block_reason_message: None,
        }),
        ..Default::default()
    }
}
