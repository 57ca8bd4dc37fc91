//! Completion Streaming Adapter
//!
//! Sends the assembled prompt to a language-model backend and exposes the
//! answer either whole or as a pull-based stream of text increments. A
//! failed completion call is terminal for the request and never retried.

use crate::config::CompletionConfig;
use crate::context::assembler::ContextWindow;
use crate::context::decoder::{decode_increments, IncrementDecoder, NdjsonDecoder, SseDecoder};
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Decoded text increments, in generation order
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Fixed persona for every answer
pub const SYSTEM_PROMPT: &str = "You are a supportive companion reflecting on the user's own \
journal entries. Analyze the entries provided, point out patterns and offer encouragement \
grounded in what was actually written. If the entries say nothing relevant, say so plainly \
instead of guessing. Keep answers concise.";

/// System instruction plus user turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Question followed by the rendered context window
pub fn build_prompt(question: &str, context: &ContextWindow) -> Prompt {
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "{}\n\nRelevant journal entries:\n{}",
            question.trim(),
            context.render()
        ),
    }
}

/// Language-model completion backend
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Whole answer in one response
    async fn complete(&self, prompt: &Prompt) -> Result<String>;

    /// Open a streamed answer. Errors here mean nothing was streamed.
    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream>;

    fn name(&self) -> &str;
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError::CompletionUnavailable {
        message: message.into(),
    }
}

/// Wire protocol of an HTTP completion backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `/chat/completions`, SSE framing when streaming
    OpenAi,
    /// `/api/chat`, newline-delimited JSON framing
    Ollama,
}

impl Backend {
    fn default_base(&self) -> &'static str {
        match self {
            Backend::OpenAi => "https://api.openai.com/v1",
            Backend::Ollama => "http://localhost:11434",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Backend::OpenAi => "/chat/completions",
            Backend::Ollama => "/api/chat",
        }
    }

    pub fn decoder(&self) -> Arc<dyn IncrementDecoder> {
        match self {
            Backend::OpenAi => Arc::new(SseDecoder),
            Backend::Ollama => Arc::new(NdjsonDecoder),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: AnswerMessage,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: AnswerMessage,
}

#[derive(Deserialize)]
struct AnswerMessage {
    #[serde(default)]
    content: String,
}

/// Completion over HTTP (OpenAI-compatible or Ollama)
pub struct HttpCompletionService {
    client: reqwest::Client,
    backend: Backend,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    decoder: Arc<dyn IncrementDecoder>,
}

impl HttpCompletionService {
    pub fn new(backend: Backend, config: &CompletionConfig) -> Result<Self> {
        // Streams can run long; only connecting is bounded at the client level
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            backend,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| backend.default_base().to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            decoder: backend.decoder(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, self.backend.path())
    }

    fn request_body(&self, prompt: &Prompt, stream: bool) -> Result<serde_json::Value> {
        let messages = [
            ChatMessage {
                role: "system",
                content: &prompt.system,
            },
            ChatMessage {
                role: "user",
                content: &prompt.user,
            },
        ];

        let body = match self.backend {
            Backend::OpenAi => serde_json::to_value(OpenAiRequest {
                model: &self.model,
                messages,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                stream,
            })?,
            Backend::Ollama => serde_json::to_value(OllamaRequest {
                model: &self.model,
                messages,
                stream,
                options: OllamaOptions {
                    temperature: self.temperature,
                    num_predict: self.max_tokens,
                },
            })?,
        };
        Ok(body)
    }

    async fn send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint())
            .json(&self.request_body(prompt, stream)?);

        if !stream {
            request = request.timeout(self.timeout);
        }
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| unavailable(format!("Completion request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("Completion API error {}: {}", status, body)));
        }

        Ok(response)
    }

    fn parse_answer(&self, body: &str) -> Result<String> {
        let malformed = |e: serde_json::Error| unavailable(format!("Malformed completion: {}", e));
        let content = match self.backend {
            Backend::OpenAi => serde_json::from_str::<OpenAiResponse>(body)
                .map_err(malformed)?
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content),
            Backend::Ollama => Some(
                serde_json::from_str::<OllamaResponse>(body)
                    .map_err(malformed)?
                    .message
                    .content,
            ),
        };

        content.ok_or_else(|| unavailable("Empty response from completion service"))
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let result: Result<String> = async {
            let body = self
                .send(prompt, false)
                .await?
                .text()
                .await
                .map_err(|e| unavailable(format!("Failed to read completion: {}", e)))?;
            self.parse_answer(&body)
        }
        .await;

        metrics::record_completion("complete", result.is_ok());
        if let Err(e) = &result {
            warn!(error = %e, "Completion failed");
        }
        result
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream> {
        match self.send(prompt, true).await {
            Ok(response) => {
                metrics::record_completion("stream", true);
                info!(format = self.decoder.format_name(), "Completion stream opened");
                Ok(decode_increments(
                    response.bytes_stream(),
                    self.decoder.clone(),
                ))
            }
            Err(e) => {
                metrics::record_completion("stream", false);
                warn!(error = %e, "Completion stream could not be opened");
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        match self.backend {
            Backend::OpenAi => "openai",
            Backend::Ollama => "ollama",
        }
    }
}

/// Scripted behaviour of [`MockCompletion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockScript {
    /// Answer with the user turn, streamed word by word
    Echo,
    /// Answer with these increments
    Tokens(Vec<String>),
    /// Stream these increments, then lose the connection
    DropAfter(Vec<String>),
    /// Fail before anything is sent
    Unavailable,
}

/// In-process completion service for local runs and tests
#[derive(Debug)]
pub struct MockCompletion {
    script: MockScript,
    last_prompt: Mutex<Option<Prompt>>,
}

impl MockCompletion {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            last_prompt: Mutex::new(None),
        }
    }

    pub fn echo() -> Self {
        Self::new(MockScript::Echo)
    }

    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MockScript::Tokens(tokens.into_iter().map(Into::into).collect()))
    }

    /// The most recent prompt received
    pub fn last_prompt(&self) -> Option<Prompt> {
        self.last_prompt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, prompt: &Prompt) {
        *self
            .last_prompt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(prompt.clone());
    }

    fn increments(&self, prompt: &Prompt) -> Result<Vec<String>> {
        match &self.script {
            MockScript::Echo => Ok(prompt.user.split_inclusive(' ').map(String::from).collect()),
            MockScript::Tokens(tokens) | MockScript::DropAfter(tokens) => Ok(tokens.clone()),
            MockScript::Unavailable => Err(unavailable("mock completion service unavailable")),
        }
    }
}

#[async_trait]
impl CompletionService for MockCompletion {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        self.record(prompt);
        if let MockScript::DropAfter(_) = self.script {
            return Err(unavailable("mock connection dropped"));
        }
        Ok(self.increments(prompt)?.concat())
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream> {
        self.record(prompt);
        let tokens = self.increments(prompt)?.into_iter().map(Ok);

        let stream: TokenStream = match self.script {
            MockScript::DropAfter(_) => Box::pin(stream::iter(
                tokens.chain(std::iter::once(Err(unavailable("mock connection dropped")))),
            )),
            _ => Box::pin(stream::iter(tokens)),
        };
        Ok(stream)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Create a completion service based on configuration
pub fn create_completion_service(config: &CompletionConfig) -> Result<Arc<dyn CompletionService>> {
    match config.provider.as_str() {
        "openai" => {
            if config.api_key.is_none() {
                return Err(AppError::Configuration {
                    message: "completion.api_key is required for the openai provider".to_string(),
                });
            }
            Ok(Arc::new(HttpCompletionService::new(Backend::OpenAi, config)?))
        }
        "ollama" => Ok(Arc::new(HttpCompletionService::new(Backend::Ollama, config)?)),
        "mock" => Ok(Arc::new(MockCompletion::echo())),
        other => Err(AppError::Configuration {
            message: format!("Unknown completion provider: {}", other),
        }),
    }
}
