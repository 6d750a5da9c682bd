use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RedlineError, Result};

/// Top-level Redline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub refine: RefineConfig,
    #[serde(default)]
    pub sections: SectionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// What the executor does after a node body fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Record the failure and schedule nothing downstream of the failed node.
    #[default]
    Halt,
    /// Record the failure and keep routing as if the node had succeeded.
    Continue,
}

/// Executor limits shared by every workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on scheduling steps per run, loop-backs included.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Per-node timeout in seconds (0 = none).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Overall invocation deadline in seconds (0 = none).
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            node_timeout_secs: default_node_timeout(),
            deadline_secs: default_deadline(),
            on_error: ErrorPolicy::default(),
        }
    }
}

fn default_max_steps() -> usize { 200 }
fn default_node_timeout() -> u64 { 300 }
fn default_deadline() -> u64 { 3600 }

/// How review participants are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    /// Every participant runs concurrently; the aggregator joins on all of them.
    #[default]
    Parallel,
    /// Participants run one after another in registered order.
    Sequential,
}

/// Fan-out review panel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub mode: ReviewMode,
    #[serde(default = "default_participants")]
    pub participants: Vec<ParticipantConfig>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            mode: ReviewMode::default(),
            participants: default_participants(),
        }
    }
}

/// A single review participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub name: String,
    /// System prompt override for this participant.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Model override for this participant.
    #[serde(default)]
    pub model: Option<ModelConfig>,
}

impl ParticipantConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: None,
            model: None,
        }
    }
}

fn default_participants() -> Vec<ParticipantConfig> {
    ["enterprise", "solution", "infrastructure", "security", "aws"]
        .into_iter()
        .map(ParticipantConfig::new)
        .collect()
}

/// Convergence loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<DimensionConfig>,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            dimensions: default_dimensions(),
        }
    }
}

/// A quality dimension checked by the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionConfig {
    /// Dimension name, e.g. "Security". The reviewer must end with
    /// `"<name> Quality: HIGH"` for the dimension to pass.
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl DimensionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: None,
        }
    }
}

fn default_max_iterations() -> usize { 5 }

fn default_dimensions() -> Vec<DimensionConfig> {
    ["General", "Security", "Infrastructure", "Data", "Compliance"]
        .into_iter()
        .map(DimensionConfig::new)
        .collect()
}

/// Per-section pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionsConfig {
    /// Overrides `workflow.on_error` for the per-section pipeline.
    #[serde(default)]
    pub on_error: Option<ErrorPolicy>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RedlineError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| RedlineError::Config(e.to_string()))
    }

    /// Error policy for the per-section pipeline.
    pub fn sections_error_policy(&self) -> ErrorPolicy {
        self.sections.on_error.unwrap_or(self.workflow.on_error)
    }
}

/// Replace `${NAME}` with the value of env var `NAME`. Unset variables and
/// an unterminated `${` are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[start..start + end + 3]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
