//! OpenAI-compatible gateway: chat completions (text and vision) and image
//! generation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{CoachError, Result};
use crate::upstream::{endpoint, read_json};

const CHAT_SERVICE: &str = "chat";
const IMAGE_SERVICE: &str = "images";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role: "system".to_string(),
            content: MessageContent::Text(content.into()),
        });
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        });
        self
    }

    /// User turn carrying a low-detail image reference for vision models.
    pub fn user_with_image(mut self, text: impl Into<String>, image_url: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.into(),
                        detail: Some("low".to_string()),
                    },
                },
            ]),
        });
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionChoice {
    pub message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// Trimmed text of the first choice; empty text is a malformed response.
    pub(crate) fn into_text(self, service: &'static str) -> Result<String> {
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(CoachError::MalformedResponse {
                service,
                detail: "completion contained no text".to_string(),
            });
        }
        Ok(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

impl ImageRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            size: "1024x1024".to_string(),
            n: 1,
            response_format: None,
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    pub fn with_response_format(mut self, format: Option<String>) -> Self {
        self.response_format = format;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedImage {
    Url(String),
    Base64(String),
}

impl GeneratedImage {
    /// Value suitable for an `<img src>`: the hosted URL or a PNG data URL.
    pub fn into_src(self) -> String {
        match self {
            GeneratedImage::Url(url) => url,
            GeneratedImage::Base64(data) => format!("data:image/png;base64,{data}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: OpenAiConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(endpoint(&self.config.base_url, path))
            .timeout(self.config.request_timeout);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    pub(crate) fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .get(endpoint(&self.config.base_url, path))
            .timeout(self.config.request_timeout);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<String> {
        debug!(model = %request.model, messages = request.messages.len(), "chat completion");
        let response = self
            .post("/v1/chat/completions")
            .json(request)
            .send()
            .await
            .map_err(CoachError::network)?;
        let payload: ChatCompletionResponse = read_json(CHAT_SERVICE, response).await?;
        payload.into_text(CHAT_SERVICE)
    }

    pub async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        debug!(model = %request.model, size = %request.size, "image generation");
        let response = self
            .post("/v1/images/generations")
            .json(request)
            .send()
            .await
            .map_err(CoachError::network)?;
        let payload: ImageResponse = read_json(IMAGE_SERVICE, response).await?;
        let datum = payload
            .data
            .into_iter()
            .next()
            .ok_or_else(|| CoachError::MalformedResponse {
                service: IMAGE_SERVICE,
                detail: "no image returned".to_string(),
            })?;
        match (datum.b64_json, datum.url) {
            (Some(data), _) if !data.is_empty() => Ok(GeneratedImage::Base64(data)),
            (_, Some(url)) if !url.is_empty() => Ok(GeneratedImage::Url(url)),
            _ => Err(CoachError::MalformedResponse {
                service: IMAGE_SERVICE,
                detail: "image entry carried neither url nor b64_json".to_string(),
            }),
        }
    }
}
