//! Distill task runner
//!
//! Runs one extraction task and prints the outcome as JSON.
//!
//! Usage: `distill-runner <task.json>`

use anyhow::Result;
use distill_runner::config::RunnerConfig;
use distill_runner::run::{apply_model_defaults, build_orchestrator, load_task};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing()?;

    let task_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("Usage: distill-runner <task.json>"))?;

    // Load configuration
    let config = RunnerConfig::load()?;
    info!(
        max_attempts = config.orchestrator.retry.max_attempts,
        cache_enabled = config.orchestrator.cache.enabled,
        "Loaded configuration"
    );

    let mut task = load_task(&task_path)?;
    apply_model_defaults(&mut task, &config);

    let orchestrator = build_orchestrator(&config).await?;
    let outcome = orchestrator.run(&task).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.success {
        warn!(
            reason = outcome.failure_reason.map(|r| r.as_str()).unwrap_or("unknown"),
            class = outcome.failure_class.map(|c| c.as_str()).unwrap_or("none"),
            "Task failed"
        );
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distill_runner=info,distill_llm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    Ok(())
}
