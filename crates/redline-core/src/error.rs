use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedlineError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Capability errors
    #[error("Capability failed: {capability}: {message}")]
    Capability { capability: String, message: String },

    // Execution errors
    #[error("Node timeout after {timeout_ms}ms: {node}")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Workflow exceeded deadline ({deadline_ms}ms)")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Node {node} wrote undeclared field '{field}'")]
    WriteContract { node: String, field: String },

    #[error("Node {node} wrote field '{field}' already written in the same step")]
    WriteConflict { node: String, field: String },

    #[error("Invalid graph: {0}")]
    Graph(String),

    #[error("Node task panicked: {0}")]
    NodePanicked(String),

    // Aggregation errors
    #[error("Aggregation attempted with no contributing records")]
    EmptyAggregation,

    #[error("Document has no sections to process")]
    NoSections,

    // Input errors
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupted document {path}: {reason}")]
    CorruptedDocument { path: String, reason: String },

    #[error("No text could be extracted from {0}")]
    EmptyDocument(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RedlineError {
    /// Shorthand for a failed capability call.
    pub fn capability(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capability {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Structural failures abort a workflow run. Everything else is recorded
    /// into the run's `error` field and the run carries on to a terminal point.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Graph(_)
                | Self::NodePanicked(_)
                | Self::EmptyAggregation
                | Self::NoSections
                | Self::Config(_)
                | Self::ConfigNotFound(_)
        ) || self.is_unsupported_input()
    }

    /// Missing or unreadable input, rejected before any workflow starts.
    pub fn is_unsupported_input(&self) -> bool {
        matches!(
            self,
            Self::DocumentNotFound(_)
                | Self::UnsupportedFormat(_)
                | Self::CorruptedDocument { .. }
                | Self::EmptyDocument(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RedlineError>;
