use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redline_core::error::{RedlineError, Result};
use redline_core::types::{Analysis, Severity};

/// One participant's contribution to a review, or an explicit failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRecord {
    pub participant: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// `None` for failure records.
    pub severity: Option<Severity>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl AggregationRecord {
    pub fn from_analysis(participant: impl Into<String>, analysis: Analysis) -> Self {
        Self {
            participant: participant.into(),
            findings: analysis.findings,
            recommendations: analysis.recommendations,
            severity: Some(analysis.severity),
            confidence: analysis.confidence.clamp(0.0, 1.0),
            failure: None,
        }
    }

    pub fn failed(participant: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            findings: vec![],
            recommendations: vec![],
            severity: None,
            confidence: 0.0,
            failure: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some() || self.severity.is_none()
    }
}

/// The reduced result of a fan-out review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    pub overall_severity: Severity,
    /// Mean severity score over successful records (LOW=1, MEDIUM=2, HIGH=3).
    pub average_score: f64,
    /// `"[participant] finding"`, in registered participant order.
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    /// Every record, failures included, in registered participant order.
    pub per_participant: Vec<AggregationRecord>,
    pub failed_participants: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Reduce per-participant records into one report.
///
/// Ordering follows `order` (registered participant order); participants not
/// listed there follow in name order. Completion order never matters.
/// Failure records are reported but excluded from the severity average.
/// Fails with `EmptyAggregation` when no successful record exists.
pub fn aggregate(
    order: &[String],
    records: &BTreeMap<String, AggregationRecord>,
) -> Result<ConsolidatedReport> {
    if records.is_empty() {
        return Err(RedlineError::EmptyAggregation);
    }

    let ordered: Vec<&AggregationRecord> = order
        .iter()
        .filter_map(|p| records.get(p))
        .chain(
            records
                .iter()
                .filter(|(p, _)| !order.contains(p))
                .map(|(_, r)| r),
        )
        .collect();

    let scored: Vec<Severity> = ordered.iter().filter_map(|r| r.severity).collect();
    if scored.is_empty() {
        return Err(RedlineError::EmptyAggregation);
    }

    let total: u32 = scored.iter().map(|s| s.score()).sum();
    let average_score = total as f64 / scored.len() as f64;

    let mut findings = Vec::new();
    let mut recommendations = Vec::new();
    let mut failed_participants = Vec::new();

    for record in &ordered {
        if record.is_failure() {
            failed_participants.push(record.participant.clone());
            continue;
        }
        let tag = |text: &String| format!("[{}] {}", record.participant, text);
        findings.extend(record.findings.iter().map(tag));
        recommendations.extend(record.recommendations.iter().map(tag));
    }

    Ok(ConsolidatedReport {
        document: None,
        overall_severity: Severity::from_average(average_score),
        average_score,
        findings,
        recommendations,
        per_participant: ordered.into_iter().cloned().collect(),
        failed_participants,
        generated_at: Utc::now(),
    })
}
