use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Multi-provider streaming LLM client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// An external, possibly failing text-producing operation
/// (writer, reviewer, editor, publisher).
pub trait Capability: Send + Sync + 'static {
    /// Name used in logs and failure records.
    fn name(&self) -> &str;

    /// Invoke the capability. No retry is applied here.
    fn invoke(&self, input: CapabilityInput) -> BoxFuture<'_, Result<String>>;
}

/// A domain specialist returning structured findings for a document.
pub trait Analyst: Send + Sync + 'static {
    /// Participant identifier.
    fn name(&self) -> &str;

    /// Analyze the document text.
    fn analyze(&self, document: String) -> BoxFuture<'_, Result<Analysis>>;
}
