//! Provider boundary: request/response types and backend traits
//!
//! The wire shapes follow the Generative Language API (`camelCase` JSON), so
//! the Gemini provider can serialize them directly. Other providers only need
//! to implement [`GenerativeBackend`] and, if they support context caching,
//! [`CacheBackend`].

use crate::error::{LLMError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of the user turn
pub const ROLE_USER: &str = "user";
/// Role of a model turn
pub const ROLE_MODEL: &str = "model";

/// Finish reasons that mean the candidate was withheld
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII", "RECITATION"];

/// A piece of content
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Part {
    /// Text payload
    #[serde(default)]
    pub text: Option<String>,
}

/// One conversation turn (or a system instruction when `role` is empty)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Content {
    /// `user`, `model`, or absent for system instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Parts of the turn
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn with_role(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.into()),
            }],
        }
    }

    /// A user turn
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Some(ROLE_USER), text)
    }

    /// A model turn
    pub fn model(text: impl Into<String>) -> Self {
        Self::with_role(Some(ROLE_MODEL), text)
    }

    /// A system instruction
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(None, text)
    }

    /// Concatenated text of all parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Sampling and output settings sent with a request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

/// A `generateContent` request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    /// Target model (part of the URL, not the body)
    #[serde(skip)]
    pub model: String,

    /// History followed by the new user turn
    pub contents: Vec<Content>,

    /// Explicit system instruction (uncached path only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,

    /// Cached context handle (cached path only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_content: Option<String>,

    /// Sampling and output settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

/// A generated candidate
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Prompt-level safety feedback
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub block_reason_message: Option<String>,
}

/// Token accounting for one call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub cached_content_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

/// A `generateContent` response
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    /// Build a single-candidate text response
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content::model(text)),
                finish_reason: Some("STOP".to_string()),
            }],
            prompt_feedback: None,
            usage_metadata: None,
        }
    }

    /// Attach usage metadata
    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage_metadata = Some(usage);
        self
    }

    /// Block reason, if the prompt or the first candidate was blocked
    pub fn block_reason(&self) -> Option<String> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.clone())
        {
            return Some(reason);
        }

        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .filter(|r| BLOCKING_FINISH_REASONS.contains(r))
            .map(str::to_string)
    }

    /// Text of the first candidate
    ///
    /// Fails when there is no candidate, the candidate was withheld, or it
    /// carries no text parts.
    pub fn text(&self) -> Result<String> {
        let candidate = self
            .candidates
            .first()
            .ok_or_else(|| LLMError::InvalidResponse("No candidates in response".to_string()))?;

        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|r| BLOCKING_FINISH_REASONS.contains(r))
        {
            return Err(LLMError::InvalidResponse(format!(
                "Candidate finished with {}",
                reason
            )));
        }

        let content = candidate
            .content
            .as_ref()
            .ok_or_else(|| LLMError::InvalidResponse("Candidate has no content".to_string()))?;

        if content.parts.iter().all(|p| p.text.is_none()) {
            return Err(LLMError::InvalidResponse("Candidate has no text parts".to_string()));
        }

        Ok(content.text())
    }

    /// Text of the first candidate's first part, without any checks
    pub fn first_part_text(&self) -> Option<String> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .and_then(|p| p.text.clone())
    }
}

/// Request to create a cached context
#[derive(Debug, Clone, PartialEq)]
pub struct CachedContentRequest {
    /// Model the cache is bound to
    pub model: String,
    /// Human-readable unique name
    pub display_name: String,
    /// Few-shot history as alternating user/model turns
    pub contents: Vec<Content>,
    /// System instruction stored with the cache
    pub system_instruction: Option<Content>,
    /// Generation settings of the owning task, for providers that bind them
    pub generation_config: Option<GenerationConfig>,
    /// Time to live in seconds
    pub ttl_seconds: u64,
}

/// A remote cached context
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedContent {
    /// Handle, e.g. `cachedContents/abc123`
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub expire_time: Option<String>,
}

/// Text generation client
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Generate content for a request
    async fn generate_content(&self, request: &GenerateContentRequest) -> Result<GenerateContentResponse>;

    /// Check that a client for `model` can be constructed
    fn check_model(&self, model: &str) -> Result<()> {
        if model.trim().is_empty() || model.chars().any(char::is_whitespace) {
            return Err(LLMError::Preparation(format!("Invalid model name '{}'", model)));
        }
        Ok(())
    }

    /// Get the name of this backend
    fn name(&self) -> &str;
}

/// Cached-context management client
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create a cached context
    async fn create_cached_content(&self, request: &CachedContentRequest) -> Result<CachedContent>;

    /// Look up a cached context; `Ok(None)` when the provider does not know it
    async fn get_cached_content(&self, name: &str) -> Result<Option<CachedContent>>;
}
