use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sr_app::engine::{EngineCommand, EngineError, EngineProcess};
use sr_gpu::{ModelHandle, ResourceError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid API key header: {0}")]
    ApiKey(#[from] reqwest::header::InvalidHeaderValue),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned no text")]
    EmptyResponse,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Text generation capability used to write the storyboard.
pub trait TextGenerator {
    fn generate(
        &mut self,
        system: &str,
        user: &str,
    ) -> impl Future<Output = Result<String, LlmError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// OpenAI-compatible chat completions endpoint.
    #[default]
    Http,
    /// Local engine process holding the model in accelerator memory.
    Engine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key, if the server needs one.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub engine: EngineCommand,
    pub load_timeout_secs: u64,
    /// Accelerator memory the engine's model needs.
    pub model_memory_mb: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Http,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            request_timeout_secs: 120,
            engine: EngineCommand::new("storyreel-text-engine", Vec::<String>::new()),
            load_timeout_secs: 600,
            model_memory_mb: 16 * 1024,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct HttpChat {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl HttpChat {
    /// # Errors
    /// If the API key is not a valid header value or the client cannot be
    /// built.
    pub fn new(config: &LlmConfig, api_key: Option<&str>) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}"))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl TextGenerator for HttpChat {
    async fn generate(&mut self, system: &str, user: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let response: ChatResponse = response.json().await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    system: &'a str,
    prompt: &'a str,
    temperature: f32,
    max_tokens: u32,
}

/// Text model served by a local engine process.
pub struct EngineText {
    process: EngineProcess,
    temperature: f32,
    max_tokens: u32,
}

impl EngineText {
    /// # Errors
    /// If the engine cannot be started or fails to load its model.
    pub async fn spawn(config: &LlmConfig) -> Result<Self, LlmError> {
        let process = EngineProcess::spawn(
            &config.engine,
            Duration::from_secs(config.load_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
        .await?;

        Ok(Self {
            process,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

impl TextGenerator for EngineText {
    async fn generate(&mut self, system: &str, user: &str) -> Result<String, LlmError> {
        let reply = self
            .process
            .request(&TextRequest {
                system,
                prompt: user,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })
            .await?;

        reply
            .text()
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
            .ok_or(LlmError::EmptyResponse)
    }
}

impl ModelHandle for EngineText {
    async fn release(self) -> Result<(), ResourceError> {
        self.process.release().await
    }
}
