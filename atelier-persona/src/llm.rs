//! Language model client for persona generation, evolution, and chat.
//!
//! One OpenAI-compatible client covers the three call shapes this service
//! needs: text-only chat, text+image persona builds, and strict-JSON
//! evolution calls. Model replies are free text; callers that expect JSON
//! go through [`parse_json_object`], which never panics on junk.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// An image attached to a completion request.
#[derive(Debug, Clone)]
pub struct ImagePart {
    /// MIME type, e.g. "image/jpeg".
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

impl ImagePart {
    /// Load an image file and encode it for transport.
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let media_type = match path.extension().and_then(|e| e.to_str()) {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };

        Ok(Self {
            media_type: media_type.to_string(),
            data: BASE64.encode(bytes),
        })
    }

    fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// A completion request in the service's unified shape.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System prompt, if any.
    pub system: Option<String>,
    /// User turn text.
    pub user_text: String,
    /// Images attached to the user turn. Non-empty switches the client
    /// to its vision model.
    pub images: Vec<ImagePart>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Generation cap.
    pub max_tokens: Option<i64>,
}

/// Unified interface to the chat/vision collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Run one completion and return the reply text.
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String>;
}

/// OpenAI-compatible chat client.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    chat_model: String,
    vision_model: String,
}

impl OpenAiChat {
    /// Create a new client with a bounded request timeout.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        chat_model: impl Into<String>,
        vision_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let api_key = api_key.into();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into(),
            chat_model: chat_model.into(),
            vision_model: vision_model.into(),
        }
    }

    fn build_messages(request: &CompletionRequest) -> Vec<ApiMessage> {
        let mut messages = Vec::new();

        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".into(),
                content: json!(system),
            });
        }

        let content = if request.images.is_empty() {
            json!(request.user_text)
        } else {
            let mut parts = vec![json!({ "type": "text", "text": request.user_text })];
            for image in &request.images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": image.to_data_url() }
                }));
            }
            json!(parts)
        };

        messages.push(ApiMessage {
            role: "user".into(),
            content,
        });

        messages
    }
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let model = if request.images.is_empty() {
            self.chat_model.clone()
        } else {
            self.vision_model.clone()
        };

        let api_request = ApiRequest {
            model,
            messages: Self::build_messages(&request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Completion request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Completion API returned {}: {}", status, body);
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse completion response: {}", e))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Completion API returned no choices"))
    }
}

/// Extract a JSON object from a model reply.
///
/// Tolerates markdown fences and prose around the object; returns `None`
/// rather than erroring on anything unparseable.
pub fn parse_json_object(reply: &str) -> Option<serde_json::Value> {
    let trimmed = reply.trim();

    // Direct parse first.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    // Fall back to the outermost brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<serde_json::Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

// ============================================================================
// Chat Completions API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: String,
}
