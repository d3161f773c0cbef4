//! Google Gemini provider implementation

use crate::client::{
    CacheBackend, CachedContent, CachedContentRequest, GenerateContentRequest, GenerateContentResponse,
    GenerativeBackend,
};
use crate::error::{LLMError, Result};
use crate::retry::{classify_provider_message, ErrorClass};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini provider
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl GeminiProvider {
    /// Create a new Gemini provider
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::new(),
        }
    }

    /// Use a different API root (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound every HTTP call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    /// Resource path of a model; tuned models keep their own prefix
    fn model_path(model: &str) -> String {
        if model.starts_with("models/") || model.starts_with("tunedModels/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        }
    }

    /// Turn a non-success response into a provider error
    async fn error_from(resp: Response) -> LLMError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                let error = v.get("error")?;
                let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
                Some(match error.get("status").and_then(Value::as_str) {
                    Some(kind) => format!("{}: {}", kind, message),
                    None => message.to_string(),
                })
            })
            .unwrap_or(body);

        LLMError::provider(Some(status.as_u16()), format!("Gemini API error: {}", message))
    }
}

#[async_trait]
impl GenerativeBackend for GeminiProvider {
    async fn generate_content(&self, request: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url,
            Self::model_path(&request.model),
            self.api_key
        );

        debug!(
            model = %request.model,
            cached = request.cached_content.is_some(),
            turns = request.contents.len(),
            "Calling Gemini generateContent"
        );

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = Self::error_from(resp).await;
            // only a rejection that names the cached content makes the handle stale
            if let (Some(handle), LLMError::Provider { status, message }) = (&request.cached_content, &err) {
                if classify_provider_message(*status, message) == ErrorClass::StaleCache {
                    return Err(LLMError::CacheNotFound(handle.clone()));
                }
            }
            return Err(err);
        }

        let resp_text = resp.text().await?;
        serde_json::from_str(&resp_text)
            .map_err(|e| LLMError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

#[async_trait]
impl CacheBackend for GeminiProvider {
    async fn create_cached_content(&self, request: &CachedContentRequest) -> Result<CachedContent> {
        let url = format!("{}/cachedContents?key={}", self.base_url, self.api_key);

        let mut body = json!({
            "model": Self::model_path(&request.model),
            "displayName": request.display_name,
            "contents": request.contents,
            "ttl": format!("{}s", request.ttl_seconds),
        });
        if let Some(system) = &request.system_instruction {
            body["systemInstruction"] = serde_json::to_value(system)?;
        }

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }

        let created: CachedContent = resp.json().await?;
        if created.name.is_empty() {
            return Err(LLMError::InvalidResponse(
                "Cached content response has no name".to_string(),
            ));
        }
        Ok(created)
    }

    async fn get_cached_content(&self, name: &str) -> Result<Option<CachedContent>> {
        let url = format!("{}/{}?key={}", self.base_url, name, self.api_key);

        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.json().await?)),
            _ => Err(Self::error_from(resp).await),
        }
    }
}
