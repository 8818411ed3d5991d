//! Text completion providers
use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use super::check_status;
use crate::memory_db::Role;

/// Completion text arriving fragment by fragment
pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Ordered chat messages sent to the completion model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(PromptMessage {
            role,
            content: content.into(),
        });
    }

    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: "local-llm".to_string(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &Prompt, options: &CompletionOptions) -> anyhow::Result<String>;

    /// Streaming variant. The default yields the whole completion as one fragment.
    async fn complete_stream(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> anyhow::Result<CompletionStream> {
        let text = self.complete(prompt, options).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ChatDelta {
    content: Option<String>,
}

/// Chat APIs only know four roles
fn chat_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant | Role::FunctionCall => "assistant",
        Role::Tool => "tool",
    }
}

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint
pub struct HttpCompletionProvider {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpCompletionProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn to_chat_messages(prompt: &Prompt) -> Vec<ChatMessage> {
        prompt
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: chat_role(m.role).to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    async fn send(&self, prompt: &Prompt, options: &CompletionOptions, stream: bool) -> anyhow::Result<reqwest::Response> {
        let request = ChatCompletionRequest {
            model: &options.model,
            messages: Self::to_chat_messages(prompt),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream,
        };
        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Completion request failed: {}", e))?;
        check_status("chat/completions", response).await
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, prompt: &Prompt, options: &CompletionOptions) -> anyhow::Result<String> {
        debug!("Requesting completion ({} prompt chars)", prompt.char_len());
        let response = self.send(prompt, options, false).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse completion response: {}", e))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| anyhow::anyhow!("Completion response contained no choices"))
    }

    async fn complete_stream(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> anyhow::Result<CompletionStream> {
        let response = self.send(prompt, options, true).await?;
        let byte_stream = response.bytes_stream();

        let fragments = async_stream::try_stream! {
            let mut buffer = String::new();
            futures_util::pin_mut!(byte_stream);
            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result.map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer.drain(..=newline_pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    let parsed: StreamChunk = serde_json::from_str(data)
                        .map_err(|e| anyhow::anyhow!("Malformed stream chunk: {}", e))?;
                    let mut finished = false;
                    for choice in parsed.choices {
                        finished |= choice.finish_reason.is_some();
                        if let Some(content) = choice.delta.and_then(|d| d.content) {
                            if !content.is_empty() {
                                yield content;
                            }
                        }
                    }
                    if finished {
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(fragments))
    }
}
