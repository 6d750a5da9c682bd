pub mod providers;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use redline_core::config::{AppConfig, ModelConfig};
use redline_core::error::Result;
use redline_core::traits::LlmClient;
use redline_core::types::{ChatMessage, StreamDelta};

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Build the shared client for a configuration, wrapping it in retry and
/// fallback handling when either is configured.
pub fn build_client(config: &AppConfig) -> Arc<dyn LlmClient> {
    let primary = create_client(&config.model);

    if config.fallback_models.is_empty() && config.model.retry.is_none() {
        return Arc::from(primary);
    }

    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    let retry_config = config.model.retry.clone().unwrap_or_default();

    Arc::new(RetryingClient::new(primary, fallbacks, retry_config))
}

/// Run a chat request to completion and return the concatenated text.
///
/// The first stream error aborts the call; partial text is discarded.
pub async fn complete(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let mut stream = llm.chat_stream(config, messages).await?;
    let mut text = String::new();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(chunk) => text.push_str(&chunk),
            StreamDelta::Stop(reason) => debug!(?reason, "LLM response complete"),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => debug!(input_tokens, output_tokens, "Token usage"),
            StreamDelta::MessageId(_) => {}
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;
    use futures::stream::BoxStream;
    use redline_core::error::RedlineError;

    use super::*;

    struct Canned(Vec<&'static str>, bool);

    impl LlmClient for Canned {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            _messages: Vec<ChatMessage>,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
            let mut deltas: Vec<Result<StreamDelta>> = self
                .0
                .iter()
                .map(|s| Ok(StreamDelta::TextDelta(s.to_string())))
                .collect();
            if self.1 {
                deltas.push(Err(RedlineError::LlmStream("connection reset".into())));
            }
            Box::pin(async move {
                Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, _>)
            })
        }
    }

    fn model(provider: &str) -> ModelConfig {
        toml::from_str(&format!("provider = \"{}\"\nmodel_id = \"m\"", provider)).unwrap()
    }

    #[tokio::test]
    async fn test_complete_concatenates_deltas() {
        let llm = Canned(vec!["Security ", "Quality: ", "HIGH"], false);
        let text = complete(&llm, &model("openai"), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(text, "Security Quality: HIGH");
    }

    #[tokio::test]
    async fn test_complete_propagates_stream_error() {
        let llm = Canned(vec!["partial"], true);
        let err = complete(&llm, &model("openai"), vec![]).await.unwrap_err();
        assert!(matches!(err, RedlineError::LlmStream(_)));
    }

    #[test]
    fn test_build_client_plain_and_wrapped() {
        let mut config: AppConfig = toml::from_str("[model]\nmodel_id = \"m\"").unwrap();
        let _plain = build_client(&config);
        config.fallback_models.push(model("openai"));
        let _wrapped = build_client(&config);
    }
}
