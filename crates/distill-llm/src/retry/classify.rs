//! Error classification for the retry engine
//!
//! Structured variants map directly. Provider failures only carry an HTTP
//! status and free text, so they go through [`classify_provider_message`],
//! which is the one place that inspects message contents. Checks run in a
//! fixed order: stale cache, safety, quota, transient.

use crate::error::LLMError;
use serde::Serialize;
use std::fmt;

/// Retry-relevant class of an attempt failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Local limiter asked us to wait; not a real failure
    InternalRateLimit,
    /// 5xx, unavailable, timeouts, connection errors
    TransientServer,
    /// Cached context handle rejected by the provider
    StaleCache,
    /// Provider quota (429 / resource exhausted)
    QuotaExceeded,
    /// Safety filters blocked the request
    SafetyBlocked,
    /// Model or client could not be prepared
    Configuration,
    /// Anything else, including malformed output
    Unclassified,
}

impl ErrorClass {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::SafetyBlocked | ErrorClass::Configuration)
    }

    /// Stable string form, used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::InternalRateLimit => "internal_rate_limit",
            ErrorClass::TransientServer => "transient_server",
            ErrorClass::StaleCache => "stale_cache",
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::SafetyBlocked => "safety_blocked",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an attempt error
pub fn classify(error: &LLMError) -> ErrorClass {
    match error {
        LLMError::RateLimited { .. } => ErrorClass::InternalRateLimit,
        LLMError::CacheNotFound(_) => ErrorClass::StaleCache,
        LLMError::Timeout(_) => ErrorClass::TransientServer,
        LLMError::SafetyBlocked(_) => ErrorClass::SafetyBlocked,
        LLMError::InvalidConfiguration(_) | LLMError::Preparation(_) => ErrorClass::Configuration,
        LLMError::InvalidResponse(_) | LLMError::SerializationError(_) => ErrorClass::Unclassified,
        LLMError::HttpError(e) => {
            if e.is_timeout() || e.is_connect() {
                ErrorClass::TransientServer
            } else {
                classify_provider_message(e.status().map(|s| s.as_u16()), &e.to_string())
            }
        }
        LLMError::Provider { status, message } => classify_provider_message(*status, message),
        LLMError::IoError(_) => ErrorClass::Unclassified,
    }
}

/// Classify a provider failure from its status code and message
pub fn classify_provider_message(status: Option<u16>, message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();

    let not_found = matches!(status, Some(404) | Some(403))
        || lower.contains("not_found")
        || lower.contains("not found")
        || lower.contains("permission_denied")
        || lower.contains("permission denied");
    if not_found && (lower.contains("cachedcontent") || lower.contains("cached content") || lower.contains("cache")) {
        return ErrorClass::StaleCache;
    }

    if lower.contains("safety") || lower.contains("prohibited_content") || lower.contains("blocked") {
        return ErrorClass::SafetyBlocked;
    }

    if status == Some(429) || lower.contains("resource_exhausted") || lower.contains("quota") {
        return ErrorClass::QuotaExceeded;
    }

    if status.is_some_and(|s| s >= 500)
        || lower.contains("unavailable")
        || lower.contains("internal")
        || lower.contains("deadline_exceeded")
        || lower.contains("timed out")
    {
        return ErrorClass::TransientServer;
    }

    ErrorClass::Unclassified
}
