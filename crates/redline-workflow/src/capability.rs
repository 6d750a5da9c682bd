//! LLM-backed capabilities and the adapter that turns a capability into a
//! `StateMap` node.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use redline_core::config::ModelConfig;
use redline_core::error::{RedlineError, Result};
use redline_core::traits::{Analyst, Capability, LlmClient};
use redline_core::types::{Analysis, CapabilityInput, ChatMessage};

use crate::graph::{Node, StateMap};

/// A text-producing capability backed by an LLM.
pub struct LlmCapability {
    name: String,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    system_prompt: String,
}

impl LlmCapability {
    pub fn new(
        name: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            llm,
            model,
            system_prompt: system_prompt.into(),
        }
    }
}

impl Capability for LlmCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: CapabilityInput) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let messages = vec![
                ChatMessage::system(self.system_prompt.clone()),
                ChatMessage::user(input.render()),
            ];

            let text = redline_llm::complete(self.llm.as_ref(), &self.model, messages)
                .await
                .map_err(|e| RedlineError::capability(&self.name, e.to_string()))?;

            if text.trim().is_empty() {
                return Err(RedlineError::capability(&self.name, "empty response"));
            }

            debug!(capability = %self.name, chars = text.len(), "Capability complete");
            Ok(text)
        })
    }
}

const ANALYSIS_FORMAT: &str = r#"Respond with ONLY a JSON object (no other text):
{"findings": ["..."], "recommendations": ["..."], "severity": "LOW" | "MEDIUM" | "HIGH", "confidence": 0.0-1.0}"#;

/// A domain-specialist analyst backed by an LLM.
pub struct LlmAnalyst {
    name: String,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    system_prompt: String,
}

impl LlmAnalyst {
    pub fn new(
        name: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            llm,
            model,
            system_prompt: system_prompt.into(),
        }
    }

    /// Default system prompt for a participant name.
    pub fn default_prompt(name: &str) -> String {
        format!(
            "You are an experienced {} architect reviewing a technical design document. \
             Identify concrete issues from your perspective and recommend fixes. \
             Rate the severity of the issues you find.",
            name
        )
    }
}

impl Analyst for LlmAnalyst {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, document: String) -> BoxFuture<'_, Result<Analysis>> {
        Box::pin(async move {
            let prompt = CapabilityInput::new(ANALYSIS_FORMAT)
                .with("document", document)
                .render();
            let messages = vec![
                ChatMessage::system(self.system_prompt.clone()),
                ChatMessage::user(prompt),
            ];

            let text = redline_llm::complete(self.llm.as_ref(), &self.model, messages)
                .await
                .map_err(|e| RedlineError::capability(&self.name, e.to_string()))?;

            parse_analysis(&text)
        })
    }
}

/// Parse an analyst reply. Tolerates code fences and surrounding prose.
pub fn parse_analysis(text: &str) -> Result<Analysis> {
    let json = extract_json(text);
    let analysis: Analysis = serde_json::from_str(json)
        .map_err(|e| RedlineError::LlmParse(format!("analysis: {}", e)))?;
    let confidence = analysis.confidence;
    Ok(analysis.with_confidence(confidence))
}

fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

/// Wrap a capability as a `StateMap` node.
///
/// The declared read keys are rendered as context (in declaration order), the
/// capability is invoked with `instruction`, and its output is ingested into
/// the declared write keys. Capability failures propagate to the executor.
pub fn capability_node(
    name: impl Into<String>,
    capability: Arc<dyn Capability>,
    instruction: impl Into<String>,
    reads: &[&str],
    writes: &[&str],
) -> Node<StateMap> {
    let instruction = instruction.into();
    let read_keys: Vec<String> = reads.iter().map(|s| s.to_string()).collect();
    let write_keys: Vec<String> = writes.iter().map(|s| s.to_string()).collect();

    let body_reads = read_keys.clone();
    let body_writes = write_keys.clone();
    Node::new(name, move |state: StateMap| {
        let capability = capability.clone();
        let instruction = instruction.clone();
        let reads = body_reads.clone();
        let writes = body_writes.clone();
        async move {
            let mut input = CapabilityInput::new(instruction);
            for key in &reads {
                if let Some(value) = state.get(key) {
                    let display = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    input = input.with(key.clone(), display);
                }
            }

            let output = capability.invoke(input).await?;
            let mut update = StateMap::new();
            update.ingest_output(&writes, &output);
            Ok(update)
        }
    })
    .with_reads(read_keys)
    .with_writes(write_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redline_core::types::Severity;

    #[test]
    fn test_parse_analysis_plain() {
        let a = parse_analysis(r#"{"findings":["No DR plan"],"recommendations":[],"severity":"HIGH","confidence":0.9}"#)
            .unwrap();
        assert_eq!(a.severity, Severity::High);
        assert_eq!(a.findings, vec!["No DR plan"]);
    }

    #[test]
    fn test_parse_analysis_code_fence() {
        let text = "Here is my review:\n```json\n{\"severity\": \"MEDIUM\", \"findings\": [\"x\"]}\n```\nThanks.";
        let a = parse_analysis(text).unwrap();
        assert_eq!(a.severity, Severity::Medium);
        assert_eq!(a.confidence, 0.85);
    }

    #[test]
    fn test_parse_analysis_prose_wrapped() {
        let text = "Sure. {\"severity\": \"low\", \"confidence\": 4} Hope that helps.";
        let a = parse_analysis(text).unwrap();
        assert_eq!(a.severity, Severity::Low);
        assert_eq!(a.confidence, 1.0);
    }

    #[test]
    fn test_parse_analysis_garbage() {
        assert!(matches!(
            parse_analysis("I could not review this."),
            Err(RedlineError::LlmParse(_))
        ));
    }
}
