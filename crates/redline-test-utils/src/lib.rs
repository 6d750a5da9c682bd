//! Scripted capabilities, analysts, and LLM clients for tests. Nothing here
//! touches the network.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use redline_core::config::{AppConfig, ModelConfig};
use redline_core::error::{RedlineError, Result};
use redline_core::traits::{Analyst, Capability, LlmClient};
use redline_core::types::{Analysis, CapabilityInput, ChatMessage, Severity, StopReason, StreamDelta};

enum Reply {
    Text(String),
    Fail(String),
    /// Return the named input field unchanged.
    Echo(String),
}

impl Reply {
    fn resolve(&self, capability: &str, input: &CapabilityInput) -> Result<String> {
        match self {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail(msg) => Err(RedlineError::capability(capability, msg.clone())),
            Reply::Echo(field) => Ok(input.get(field).unwrap_or_default().to_string()),
        }
    }
}

/// A capability that replays scripted replies. The last reply repeats once
/// the script runs out.
pub struct ScriptedCapability {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<CapabilityInput>>,
}

impl ScriptedCapability {
    fn with_script(name: &str, script: Vec<Reply>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Reply with each text in turn.
    pub fn sequence(name: &str, replies: &[&str]) -> Self {
        Self::with_script(name, replies.iter().map(|r| Reply::Text(r.to_string())).collect())
    }

    /// Always reply with `reply`.
    pub fn always(name: &str, reply: &str) -> Self {
        Self::sequence(name, &[reply])
    }

    /// Always fail with a capability error.
    pub fn failing(name: &str, message: &str) -> Self {
        Self::with_script(name, vec![Reply::Fail(message.to_string())])
    }

    /// Return the input field `field` unchanged.
    pub fn echo(name: &str, field: &str) -> Self {
        Self::with_script(name, vec![Reply::Echo(field.to_string())])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every input received, in call order.
    pub fn inputs(&self) -> Vec<CapabilityInput> {
        self.inputs.lock().unwrap().clone()
    }

    fn next_reply(&self, input: &CapabilityInput) -> Result<String> {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = script.pop_front() {
            *last = Some(reply);
        }
        match last.as_ref() {
            Some(reply) => reply.resolve(&self.name, input),
            None => Err(RedlineError::capability(&self.name, "empty script")),
        }
    }
}

impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: CapabilityInput) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next_reply(&input)
        })
    }
}

/// An analyst returning a fixed analysis (or failure) after an optional delay.
pub struct StaticAnalyst {
    name: String,
    result: std::result::Result<Analysis, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticAnalyst {
    pub fn new(name: &str, analysis: Analysis) -> Self {
        Self {
            name: name.to_string(),
            result: Ok(analysis),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// An analyst with one finding and one recommendation at `severity`.
    pub fn rated(name: &str, severity: Severity) -> Self {
        Self::new(
            name,
            Analysis::new(severity)
                .with_findings(vec![format!("{} finding", name)])
                .with_recommendations(vec![format!("{} recommendation", name)]),
        )
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Err(message.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Analyst for StaticAnalyst {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, _document: String) -> BoxFuture<'_, Result<Analysis>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result
                .clone()
                .map_err(|msg| RedlineError::capability(&self.name, msg))
        })
    }
}

/// An LLM client that streams canned replies, one per call, in two chunks.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Messages of every request, in call order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(messages);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RedlineError::LlmRequest("HTTP 500: no scripted reply".into()))?;

            let mid = reply.char_indices().nth(reply.chars().count() / 2).map_or(0, |(i, _)| i);
            let (head, tail) = reply.split_at(mid);
            let deltas = vec![
                Ok(StreamDelta::TextDelta(head.to_string())),
                Ok(StreamDelta::TextDelta(tail.to_string())),
                Ok(StreamDelta::Stop(StopReason::EndTurn)),
            ];
            let stream: BoxStream<'_, Result<StreamDelta>> = Box::pin(stream::iter(deltas));
            Ok(stream)
        })
    }
}

/// Parse a config from TOML text.
pub fn config_from_toml(text: &str) -> AppConfig {
    toml::from_str(text).unwrap()
}

/// A temp directory holding `name` with `contents`. Keep the `TempDir`
/// alive for as long as the file is needed.
pub fn fixture_file(name: &str, contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
