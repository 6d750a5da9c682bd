use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use redline_core::config::ModelConfig;
use redline_core::error::{RedlineError, Result};
use redline_core::traits::LlmClient;
use redline_core::types::*;

use crate::streaming::{ensure_success, into_deltas, SseEvent};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

/// Stream events the client acts on. Block boundaries, pings and anything
/// newer than this client collapse into `Ignored`.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: MessageStart },
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Error { error: ApiError },
    #[serde(other)]
    Ignored,
}

#[derive(Deserialize, Debug)]
struct MessageStart {
    id: String,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

impl Usage {
    fn into_delta(self) -> StreamDelta {
        StreamDelta::Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

/// Split out the system prompt; the Messages API takes it as a top-level
/// field. Multiple system messages are joined with a blank line.
fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let (system, turns): (Vec<_>, Vec<_>) = messages
        .into_iter()
        .partition(|m| m.role == Role::System);

    let system = (!system.is_empty()).then(|| {
        system
            .into_iter()
            .map(|m| m.content)
            .collect::<Vec<_>>()
            .join("\n\n")
    });
    let turns = turns
        .into_iter()
        .map(|m| ApiMessage {
            role: if m.role == Role::Assistant { "assistant" } else { "user" },
            content: m.content,
        })
        .collect();
    (system, turns)
}

fn stop_reason(reason: &str) -> Option<StopReason> {
    match reason {
        "end_turn" => Some(StopReason::EndTurn),
        "max_tokens" => Some(StopReason::MaxTokens),
        "stop_sequence" => Some(StopReason::StopSequence),
        _ => None,
    }
}

fn parse_event(event: SseEvent) -> Vec<Result<StreamDelta>> {
    let parsed = match serde_json::from_str::<StreamEvent>(&event.data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                event = event.event_type.as_deref().unwrap_or("-"),
                error = %e,
                "Skipping unparseable message event"
            );
            return Vec::new();
        }
    };

    match parsed {
        StreamEvent::MessageStart { message } => {
            let mut deltas = vec![Ok(StreamDelta::MessageId(message.id))];
            deltas.extend(message.usage.map(|u| Ok(u.into_delta())));
            deltas
        }
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } => vec![Ok(StreamDelta::TextDelta(text))],
        StreamEvent::MessageDelta { delta, usage } => usage
            .map(Usage::into_delta)
            .into_iter()
            .chain(delta.stop_reason.as_deref().and_then(stop_reason).map(StreamDelta::Stop))
            .map(Ok)
            .collect(),
        StreamEvent::Error { error } => {
            debug!(message = %error.message, "Provider reported a stream error");
            vec![Err(RedlineError::LlmStream(error.message))]
        }
        StreamEvent::ContentBlockDelta { .. } | StreamEvent::Ignored => Vec::new(),
    }
}

impl LlmClient for AnthropicClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_API_URL.to_string());
        let api_key = config.api_key.clone();
        let (system, turns) = convert_messages(messages);
        let body = AnthropicRequest {
            model: config.model_id.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            messages: turns,
            system,
            stream: true,
        };

        Box::pin(async move {
            let api_key = api_key
                .ok_or_else(|| RedlineError::Config("Anthropic API key not set".into()))?;

            let response = self
                .http
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| RedlineError::LlmRequest(e.to_string()))?;
            let response = ensure_success(response).await?;

            Ok(into_deltas(response, parse_event))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_system_prompt_extracted() {
        let (system, msgs) = convert_messages(vec![
            ChatMessage::system("You are a security architect."),
            ChatMessage::user("Review this."),
        ]);
        assert_eq!(system.as_deref(), Some("You are a security architect."));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
    }

    #[test]
    fn test_assistant_turns_keep_order() {
        let (system, msgs) = convert_messages(vec![
            ChatMessage::user("draft"),
            ChatMessage::system("one"),
            ChatMessage::assistant("v1"),
            ChatMessage::system("two"),
        ]);
        assert_eq!(system.as_deref(), Some("one\n\ntwo"));
        let roles: Vec<&str> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
    }

    #[test]
    fn test_message_start_carries_id_and_usage() {
        let deltas = parse_event(event(
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":40}}}"#,
        ));
        assert!(matches!(&deltas[0], Ok(StreamDelta::MessageId(id)) if id == "msg_1"));
        assert!(matches!(
            &deltas[1],
            Ok(StreamDelta::Usage { input_tokens: 40, output_tokens: 0 })
        ));
    }

    #[test]
    fn test_text_delta() {
        let deltas = parse_event(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        ));
        assert!(matches!(deltas.as_slice(), [Ok(StreamDelta::TextDelta(t))] if t == "ok"));
    }

    #[test]
    fn test_message_delta_usage_then_stop() {
        let deltas = parse_event(event(
            r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":12}}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[1], Ok(StreamDelta::Stop(StopReason::MaxTokens))));
    }

    #[test]
    fn test_error_event() {
        let deltas = parse_event(event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        assert!(matches!(deltas.as_slice(), [Err(RedlineError::LlmStream(m))] if m == "Overloaded"));
    }

    #[test]
    fn test_ignored_events() {
        assert!(parse_event(event(r#"{"type":"ping"}"#)).is_empty());
        assert!(parse_event(event(r#"{"type":"content_block_stop","index":0}"#)).is_empty());
        assert!(parse_event(event("not json")).is_empty());
    }
}
