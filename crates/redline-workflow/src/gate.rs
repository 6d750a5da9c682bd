//! Multi-dimension quality gate over reviewer feedback.
//!
//! Each reviewer must end its feedback with the exact marker
//! `"<Dimension> Quality: HIGH"` or `"<Dimension> Quality: LOW"`. Anything
//! other than the exact HIGH marker counts as not met.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The marker a reviewer must emit for `dimension` to pass.
pub fn high_marker(dimension: &str) -> String {
    format!("{} Quality: HIGH", dimension)
}

/// The marker a reviewer emits for `dimension` to fail.
pub fn low_marker(dimension: &str) -> String {
    format!("{} Quality: LOW", dimension)
}

/// Whether `feedback` contains the exact HIGH marker for `dimension`.
pub fn parse_verdict(dimension: &str, feedback: &str) -> bool {
    feedback.contains(&high_marker(dimension))
}

/// Per-dimension verdicts, in dimension order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub verdicts: Vec<(String, bool)>,
}

impl GateResult {
    /// True iff every dimension is met.
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|(_, met)| *met)
    }

    /// Dimensions that were not met.
    pub fn failing(&self) -> Vec<&str> {
        self.verdicts
            .iter()
            .filter(|(_, met)| !met)
            .map(|(d, _)| d.as_str())
            .collect()
    }
}

/// Evaluate the gate. Missing feedback for a dimension counts as not met.
pub fn evaluate_gate(dimensions: &[String], feedback: &BTreeMap<String, String>) -> GateResult {
    let verdicts = dimensions
        .iter()
        .map(|dim| {
            let text = feedback.get(dim).map(String::as_str).unwrap_or("");
            let met = parse_verdict(dim, text);
            if !met && !text.contains(&low_marker(dim)) {
                warn!(dimension = %dim, "Reviewer feedback has no quality marker, treating as LOW");
            }
            (dim.clone(), met)
        })
        .collect();

    GateResult { verdicts }
}
