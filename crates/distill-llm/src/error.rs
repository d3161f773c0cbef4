//! Error types for distill LLM orchestration

use std::time::Duration;
use thiserror::Error;

/// Result type alias for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// LLM orchestration errors
///
/// Provider failures arrive as [`LLMError::Provider`] and are mapped to a
/// retry decision by [`crate::retry::classify`]; the remaining variants are
/// raised by this crate itself.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Provider returned a non-success response
    #[error("Provider call failed ({}): {message}", .status.map_or_else(|| "no status".to_string(), |s| s.to_string()))]
    Provider {
        /// HTTP status code, when the transport produced one
        status: Option<u16>,
        /// Provider message, including its status string when available
        message: String,
    },

    /// Local rate limiter rejected the call; retry after `wait`
    #[error("Rate limited by local limiter, retry in {}ms", .wait.as_millis())]
    RateLimited {
        /// Time until the next slot opens
        wait: Duration,
    },

    /// A cached context handle is unknown to the provider
    #[error("Cached content not found: {0}")]
    CacheNotFound(String),

    /// Provider call exceeded the configured timeout
    #[error("Provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Prompt or candidate was blocked by provider safety filters
    #[error("Response blocked: {0}")]
    SafetyBlocked(String),

    /// Invalid response format
    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Model or client could not be prepared
    #[error("Model preparation failed: {0}")]
    Preparation(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl LLMError {
    /// Create a provider error from a status code and message
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        LLMError::Provider {
            status,
            message: message.into(),
        }
    }
}
