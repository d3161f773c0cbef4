//! Task request and orchestration outcome types

use crate::client::{Content, UsageMetadata};
use crate::retry::ErrorClass;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Output format requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// `application/json`
    #[default]
    Json,
    /// `text/plain`
    Text,
}

impl ResponseFormat {
    /// MIME type sent to the provider
    pub fn mime_type(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "application/json",
            ResponseFormat::Text => "text/plain",
        }
    }
}

/// Sampling and output parameters for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Nucleus sampling mass
    #[serde(default)]
    pub top_p: Option<f32>,

    /// Top-k sampling
    #[serde(default)]
    pub top_k: Option<u32>,

    /// Output token ceiling
    #[serde(default)]
    pub max_output_tokens: Option<u32>,

    /// Requested output format
    #[serde(default)]
    pub response_format: ResponseFormat,

    /// JSON schema the output must follow (JSON format only)
    #[serde(default)]
    pub response_schema: Option<Value>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            top_p: None,
            top_k: None,
            max_output_tokens: Some(8192),
            response_format: ResponseFormat::Json,
            response_schema: None,
        }
    }
}

/// One few-shot demonstration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    /// Example user input
    pub input: String,
    /// Expected model output
    pub output: String,
}

impl FewShotExample {
    /// Create a new example pair
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Both halves are present
    pub fn is_complete(&self) -> bool {
        !self.input.trim().is_empty() && !self.output.trim().is_empty()
    }
}

/// Few-shot pairs as alternating user/model turns
///
/// Pairs with a blank half are logged and left out.
pub fn few_shot_history(examples: &[FewShotExample]) -> Vec<Content> {
    let mut contents = Vec::with_capacity(examples.len() * 2);
    for (index, example) in examples.iter().enumerate() {
        if !example.is_complete() {
            warn!(index, "Skipping unpaired few-shot entry");
            continue;
        }
        contents.push(Content::user(example.input.clone()));
        contents.push(Content::model(example.output.clone()));
    }
    contents
}

/// Immutable input for one logical extraction request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task type, used for cache keys and logging
    pub task_type: String,

    /// Primary model
    #[serde(default)]
    pub model_name: Option<String>,

    /// Fallback model, tried after the primary fails
    #[serde(default)]
    pub fallback_model_name: Option<String>,

    /// The new user turn
    pub prompt: String,

    /// System instruction text (may be empty)
    #[serde(default)]
    pub system_instruction: String,

    /// Ordered few-shot demonstrations
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,

    /// Generation parameters
    #[serde(default)]
    pub generation: GenerationParameters,

    /// Whether a context cache may be used
    #[serde(default)]
    pub use_cache: bool,

    /// Logical stream inside the task type (e.g. batch index)
    #[serde(default)]
    pub stream_key: Option<String>,
}

impl TaskRequest {
    /// Create a new task request with a primary model
    pub fn new(task_type: impl Into<String>, model_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            model_name: Some(model_name.into()),
            fallback_model_name: None,
            prompt: prompt.into(),
            system_instruction: String::new(),
            few_shot_examples: Vec::new(),
            generation: GenerationParameters::default(),
            use_cache: false,
            stream_key: None,
        }
    }

    /// Replace the primary model; `None` skips the primary phase
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model_name = model;
        self
    }

    /// Set the fallback model
    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model_name = Some(model.into());
        self
    }

    /// Set system instruction
    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = text.into();
        self
    }

    /// Set few-shot examples
    pub fn with_few_shot(mut self, examples: Vec<FewShotExample>) -> Self {
        self.few_shot_examples = examples;
        self
    }

    /// Set generation parameters
    pub fn with_generation(mut self, generation: GenerationParameters) -> Self {
        self.generation = generation;
        self
    }

    /// Enable or disable context caching
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Set the stream key
    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        self.stream_key = Some(key.into());
        self
    }
}

/// How a model's request is shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTreatment {
    /// Fine-tuned model: plain text output, bare prompt with fixed prefix
    Tuned,
    /// General model: schema output, system instruction, few-shot, cache
    NonTuned,
}

impl fmt::Display for ModelTreatment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTreatment::Tuned => write!(f, "tuned"),
            ModelTreatment::NonTuned => write!(f, "non-tuned"),
        }
    }
}

/// Why an orchestration (or one of its phases) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Neither a primary nor a fallback model was configured
    NoPrimaryModel,
    /// Single-shot attempt failed with a retryable error
    FailedFirstAttempt,
    /// Retry budget exhausted
    ExhaustedRetries,
    /// Provider safety filters blocked the request
    SafetyBlocked,
    /// Model or client could not be prepared
    PreparationFailed,
}

impl FailureReason {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NoPrimaryModel => "no_primary_model",
            FailureReason::FailedFirstAttempt => "failed_first_attempt",
            FailureReason::ExhaustedRetries => "exhausted_retries",
            FailureReason::SafetyBlocked => "safety_blocked",
            FailureReason::PreparationFailed => "preparation_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal value of one orchestrated request
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationOutcome {
    /// Cleaned JSON text (empty on failure)
    pub response_text: String,

    /// Token usage reported by the provider
    pub usage: Option<UsageMetadata>,

    /// Whether a model produced a valid response
    pub success: bool,

    /// Whether the fallback phase produced this outcome
    pub used_fallback: bool,

    /// Model of the phase that produced this outcome
    pub model_used: Option<String>,

    /// Treatment applied to that model
    pub treatment: Option<ModelTreatment>,

    /// Failure reason, set when `success` is false
    pub failure_reason: Option<FailureReason>,

    /// Class of the last attempt error, when a phase ran out of options
    pub failure_class: Option<ErrorClass>,

    /// Last error detail, when the outcome is a failure
    pub failure_detail: Option<String>,

    /// Attempts consumed by the deciding phase
    pub attempts: u32,

    /// Wall-clock time of the whole orchestration
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl OrchestrationOutcome {
    pub(crate) fn failure(reason: FailureReason, detail: Option<String>, elapsed: Duration) -> Self {
        Self {
            response_text: String::new(),
            usage: None,
            success: false,
            used_fallback: false,
            model_used: None,
            treatment: None,
            failure_reason: Some(reason),
            failure_class: None,
            failure_detail: detail,
            attempts: 0,
            elapsed,
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
