use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved field every node may write, regardless of its declared writes.
pub const ERROR_FIELD: &str = "error";

/// A node failure recorded into the state instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub message: String,
}

impl NodeFailure {
    pub fn new(node: impl Into<String>, message: impl ToString) -> Self {
        Self {
            node: node.into(),
            message: message.to_string(),
        }
    }
}

/// A partial update returned by a node.
pub trait StateUpdate: Send + 'static {
    /// Names of the fields this update writes. Checked against the node's
    /// declared writes and against other updates in the same step.
    fn fields(&self) -> Vec<String>;
}

/// The shared state threaded through one workflow run.
pub trait WorkflowState: Clone + Send + Sync + 'static {
    type Update: StateUpdate;

    /// Merge a partial update. Fields the update does not touch are kept.
    fn apply(&mut self, update: Self::Update);

    /// Read-only view handed to a node. An empty `reads` list means the whole
    /// state.
    fn view(&self, reads: &[String]) -> Self {
        let _ = reads;
        self.clone()
    }

    /// Record a failure into the reserved `error` field.
    fn record_failure(&mut self, failure: NodeFailure);
}

/// Untyped state: string keys to JSON values.
///
/// Updates are themselves `StateMap`s holding only the keys a node writes.
/// Failures accumulate under the `error` key as a list of
/// `{"node", "message"}` objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMap {
    data: BTreeMap<String, serde_json::Value>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Builder form of `set`.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(key, value);
        self
    }

    /// Merge another map into this one (overwrites on conflict).
    pub fn merge(&mut self, other: StateMap) {
        self.data.extend(other.data);
    }

    /// Store a node's output under its write keys.
    ///
    /// A JSON object output is split per key; anything else is stored whole
    /// under every key.
    pub fn ingest_output(&mut self, output_keys: &[String], output_text: &str) {
        if output_keys.is_empty() {
            return;
        }

        if let Ok(serde_json::Value::Object(obj)) =
            serde_json::from_str::<serde_json::Value>(output_text)
        {
            for key in output_keys {
                if let Some(val) = obj.get(key) {
                    self.data.insert(key.clone(), val.clone());
                }
            }
            return;
        }

        for key in output_keys {
            self.set_str(key.clone(), output_text);
        }
    }

    /// Failures recorded so far.
    pub fn failures(&self) -> Vec<NodeFailure> {
        self.data
            .get(ERROR_FIELD)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}

impl StateUpdate for StateMap {
    fn fields(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}

impl WorkflowState for StateMap {
    type Update = StateMap;

    fn apply(&mut self, update: StateMap) {
        let mut update = update;
        // Errors written by a node append to the list rather than replace it.
        if let Some(serde_json::Value::Array(new)) = update.data.remove(ERROR_FIELD) {
            for item in new {
                if let Ok(failure) = serde_json::from_value(item) {
                    self.record_failure(failure);
                }
            }
        }
        self.merge(update);
    }

    fn view(&self, reads: &[String]) -> Self {
        if reads.is_empty() {
            return self.clone();
        }
        Self {
            data: self
                .data
                .iter()
                .filter(|(k, _)| reads.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn record_failure(&mut self, failure: NodeFailure) {
        let entry = serde_json::json!({ "node": failure.node, "message": failure.message });
        match self.data.get_mut(ERROR_FIELD) {
            Some(serde_json::Value::Array(list)) => list.push(entry),
            _ => {
                self.data
                    .insert(ERROR_FIELD.to_string(), serde_json::Value::Array(vec![entry]));
            }
        }
    }
}

/// Whether a view restricted to `reads` includes `field`.
pub(crate) fn wants(reads: &[String], field: &str) -> bool {
    reads.is_empty() || reads.iter().any(|r| r == field)
}
