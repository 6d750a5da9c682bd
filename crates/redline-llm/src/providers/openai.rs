use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use redline_core::config::ModelConfig;
use redline_core::error::{RedlineError, Result};
use redline_core::traits::LlmClient;
use redline_core::types::*;

use crate::streaming::{ensure_success, into_deltas, SseEvent};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| OaiMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content,
        })
        .collect()
}

/// o-series reasoning models reject `temperature`.
fn is_reasoning_model(model_id: &str) -> bool {
    ["o1", "o3", "o4"].iter().any(|p| model_id.starts_with(p))
}

impl ChatRequest {
    fn streaming(config: &ModelConfig, messages: Vec<ChatMessage>) -> Self {
        let temperature = (!is_reasoning_model(&config.model_id)).then_some(config.temperature);
        Self {
            model: config.model_id.clone(),
            messages: convert_messages(messages),
            max_tokens: config.max_tokens,
            temperature,
            stream: true,
        }
    }
}

fn stop_reason(finish_reason: &str) -> StopReason {
    if finish_reason == "length" {
        StopReason::MaxTokens
    } else {
        StopReason::EndTurn
    }
}

/// Deltas carried by one `chat.completion.chunk`. Unparseable chunks and
/// the `[DONE]` sentinel yield nothing.
fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return Vec::new();
    }

    let chunk = match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Skipping unparseable completion chunk");
            return Vec::new();
        }
    };

    let usage = chunk.usage.map(|u| StreamDelta::Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });
    let (text, stop) = match chunk.choices.into_iter().next() {
        Some(choice) => (
            choice
                .delta
                .and_then(|d| d.content)
                .filter(|t| !t.is_empty())
                .map(StreamDelta::TextDelta),
            choice
                .finish_reason
                .map(|r| StreamDelta::Stop(stop_reason(&r))),
        ),
        None => (None, None),
    };

    [usage, text, stop].into_iter().flatten().map(Ok).collect()
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let url = config.base_url.clone().unwrap_or_else(|| OPENAI_API_URL.to_string());
        let api_key = config.api_key.clone();
        let body = ChatRequest::streaming(config, messages);

        Box::pin(async move {
            let mut request = self.http.post(&url).json(&body);
            if let Some(key) = api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| RedlineError::LlmRequest(e.to_string()))?;
            let response = ensure_success(response).await?;

            Ok(into_deltas(response, parse_chunk))
        })
    }
}
