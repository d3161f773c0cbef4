//! Runner configuration

use distill_llm::OrchestratorConfig;
use serde::{Deserialize, Serialize};

/// Default config file, without extension
pub const DEFAULT_CONFIG_FILE: &str = "config/distill";

/// Runner configuration
///
/// Read from `config/distill.{toml,yaml,json}` and `DISTILL_*` environment
/// variables; nested keys use `__`, e.g. `DISTILL_ORCHESTRATOR__RETRY__MAX_ATTEMPTS`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Provider API key
    pub api_key: Option<String>,

    /// Provider API root override
    pub base_url: Option<String>,

    /// Primary model for tasks that do not name one
    pub default_model: Option<String>,

    /// Fallback model for tasks that do not name one
    pub fallback_model: Option<String>,

    /// Orchestration settings
    pub orchestrator: OrchestratorConfig,
}

impl RunnerConfig {
    /// Load configuration from `.env`, the default config file and the environment
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if exists
        dotenvy::dotenv().ok();
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from `file` (optional) and the environment
    pub fn load_from(file: &str) -> anyhow::Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("DISTILL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to read config: {}", e))?
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runner cannot serve with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key().is_none() {
            anyhow::bail!("api_key is not configured (set DISTILL_API_KEY)");
        }
        if self.default_model().is_none() && self.fallback_model().is_none() {
            anyhow::bail!("No model configured: set default_model or fallback_model");
        }
        self.orchestrator
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid orchestrator config: {}", e))
    }

    /// API key, if set and non-blank
    pub fn api_key(&self) -> Option<&str> {
        non_blank(self.api_key.as_deref())
    }

    pub fn default_model(&self) -> Option<&str> {
        non_blank(self.default_model.as_deref())
    }

    pub fn fallback_model(&self) -> Option<&str> {
        non_blank(self.fallback_model.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
