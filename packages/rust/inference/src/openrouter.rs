//! OpenRouter (OpenAI-compatible chat completions) backend.
//!
//! Each call sends one user message holding the prompt and the image as a
//! base64 `data:` URL.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use imgdesc_shared::{ImgDescError, Result};

use crate::backend::{InferenceBackend, InferenceError};

/// User-Agent string for inference requests.
const USER_AGENT: &str = concat!("imgdesc/", env!("CARGO_PKG_VERSION"));

/// Longest error body echoed into a `Model` error.
const MAX_ERROR_BODY: usize = 200;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// HTTP backend for OpenRouter or any OpenAI-compatible endpoint.
pub struct OpenRouterBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenRouterBackend {
    /// `base_url` is the API root, e.g. `https://openrouter.ai/api/v1`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ImgDescError::Inference(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl InferenceBackend for OpenRouterBackend {
    async fn call(
        &self,
        model: &str,
        prompt: &str,
        payload: &[u8],
    ) -> std::result::Result<String, InferenceError> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url(payload),
                        },
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| InferenceError::Model(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            debug!(?retry_after, "backend rate limited");
            return Err(InferenceError::RateLimited { retry_after });
        }

        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::Model(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(InferenceError::Model(format!(
                "HTTP {status}: {}",
                truncate(&body, MAX_ERROR_BODY)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            InferenceError::Model(format!(
                "invalid response: {e} (got: {})",
                truncate(&body, MAX_ERROR_BODY)
            ))
        })?;

        if let Some(error) = parsed.error {
            return Err(InferenceError::Model(error.message));
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::Model("response contained no message content".into()))
    }
}

/// Encode `payload` as a `data:` URL with a sniffed MIME type.
fn data_url(payload: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        sniff_mime(payload),
        general_purpose::STANDARD.encode(payload)
    )
}

/// Guess an image MIME type from magic bytes.
fn sniff_mime(payload: &[u8]) -> &'static str {
    match payload {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "application/octet-stream",
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
