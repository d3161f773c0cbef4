//! One-shot task execution

use crate::config::RunnerConfig;
use distill_llm::{CacheBackend, GeminiProvider, Orchestrator, TaskRequest};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Read a task request from a JSON file
pub fn load_task(path: &Path) -> anyhow::Result<TaskRequest> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read task file {}: {}", path.display(), e))?;
    serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse task file {}: {}", path.display(), e))
}

/// Fill models the task leaves out from the configured defaults
pub fn apply_model_defaults(task: &mut TaskRequest, config: &RunnerConfig) {
    let missing = |model: &Option<String>| model.as_deref().map_or(true, |m| m.trim().is_empty());

    if missing(&task.model_name) {
        task.model_name = config.default_model().map(str::to_string);
    }
    if missing(&task.fallback_model_name) {
        task.fallback_model_name = config.fallback_model().map(str::to_string);
    }
}

/// Build an orchestrator backed by the Gemini provider
pub async fn build_orchestrator(config: &RunnerConfig) -> anyhow::Result<Orchestrator> {
    let api_key = config
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("api_key is not configured"))?;

    let mut provider = GeminiProvider::new(api_key.to_string()).with_timeout(config.orchestrator.request_timeout())?;
    if let Some(base_url) = &config.base_url {
        provider = provider.with_base_url(base_url.clone());
    }
    let provider = Arc::new(provider);
    let cache_backend: Arc<dyn CacheBackend> = provider.clone();

    let orchestrator = Orchestrator::build(provider, Some(cache_backend), config.orchestrator.clone()).await?;
    info!(
        default_model = config.default_model().unwrap_or("<none>"),
        fallback_model = config.fallback_model().unwrap_or("<none>"),
        "Orchestrator initialized"
    );
    Ok(orchestrator)
}
