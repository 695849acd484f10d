// Blocking client for an OpenAI-compatible chat-completions endpoint
// serving the vision model. Owns request construction (base64 image
// attachment) and response cleanup at the interface boundary.

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::canonical::strip_thinking;
use super::orchestrator::{ImageAttachment, VisionClient};
use super::ExtractionError;

const DEFAULT_MODEL: &str = "google/medgemma-1.5-4b-it";
const DEFAULT_TIMEOUT_SECS: u64 = 500;
const DEFAULT_MAX_TOKENS: u32 = 2500;

/// Endpoint configuration. Endpoint and API key are mandatory; a missing
/// value is a fatal configuration error, never retried.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ExtractionError> {
        let endpoint = std::env::var("MEDBRIDGE_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                ExtractionError::Config("MEDBRIDGE_ENDPOINT must be set".to_string())
            })?;
        let api_key = std::env::var("MEDBRIDGE_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ExtractionError::Config("MEDBRIDGE_API_KEY must be set".to_string()))?;

        Ok(Self {
            endpoint,
            api_key,
            model: std::env::var("MEDBRIDGE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            max_tokens: std::env::var("MEDBRIDGE_MAX_TOKENS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_MAX_TOKENS),
            timeout_secs: std::env::var("MEDBRIDGE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        })
    }
}

pub struct HttpVisionClient {
    config: ClientConfig,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl HttpVisionClient {
    pub fn new(config: ClientConfig) -> Result<Self, ExtractionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ExtractionError::Config(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        )
    }

    fn user_content(prompt: &str, image: Option<&ImageAttachment>) -> serde_json::Value {
        match image {
            None => serde_json::Value::String(prompt.to_string()),
            Some(image) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&image.data);
                serde_json::json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:{};base64,{}", image.mime, encoded)
                    }},
                ])
            }
        }
    }
}

impl VisionClient for HttpVisionClient {
    fn query(
        &self,
        prompt: &str,
        system: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<String, ExtractionError> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: serde_json::Value::String(system.to_string()),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: Self::user_content(prompt, image),
        });

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
        };

        let url = self.chat_url();
        tracing::debug!(%url, model = %self.config.model, "posting extraction request");

        let response = self.client.post(&url).bearer_auth(&self.config.api_key).json(&body).send().map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout(self.config.timeout_secs)
            } else if e.is_connect() {
                ExtractionError::Connection(self.config.endpoint.clone())
            } else {
                ExtractionError::ResponseParsing(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ExtractionError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| ExtractionError::ResponseParsing(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ExtractionError::ResponseParsing("empty choices array".to_string()))?;

        // Deliberation spans are stripped here so the parser only ever
        // sees the answer itself.
        Ok(strip_thinking(&content))
    }
}

/// Fixed-response client for tests.
pub struct MockVisionClient {
    response: String,
}

impl MockVisionClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
        }
    }
}

impl VisionClient for MockVisionClient {
    fn query(
        &self,
        _prompt: &str,
        _system: &str,
        _image: Option<&ImageAttachment>,
    ) -> Result<String, ExtractionError> {
        Ok(self.response.clone())
    }
}
