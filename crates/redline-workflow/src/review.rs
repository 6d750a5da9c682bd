//! Fan-out review: every analyst reviews the same document, an aggregator
//! joins on all of them and produces one consolidated report.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use redline_core::config::{AppConfig, ErrorPolicy, ReviewMode};
use redline_core::error::{RedlineError, Result};
use redline_core::traits::{Analyst, LlmClient};

use crate::aggregate::{aggregate, AggregationRecord, ConsolidatedReport};
use crate::capability::LlmAnalyst;
use crate::graph::state::wants;
use crate::graph::{
    ExecutionResult, ExecutorConfig, Graph, GraphExecutor, Node, NodeFailure, StateUpdate,
    WorkflowState, ERROR_FIELD,
};

pub const AGGREGATE_NODE: &str = "aggregate";

#[derive(Debug, Clone, Default)]
pub struct ReviewState {
    pub document: String,
    pub document_path: Option<String>,
    /// One record per participant, failures included.
    pub reviews: BTreeMap<String, AggregationRecord>,
    pub report: Option<ConsolidatedReport>,
    pub errors: Vec<NodeFailure>,
}

impl ReviewState {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.document_path = Some(path.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct ReviewUpdate {
    pub reviews: Vec<AggregationRecord>,
    pub report: Option<ConsolidatedReport>,
    pub errors: Vec<NodeFailure>,
}

impl StateUpdate for ReviewUpdate {
    fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .reviews
            .iter()
            .map(|r| format!("reviews.{}", r.participant))
            .collect();
        if self.report.is_some() {
            fields.push("report".into());
        }
        if !self.errors.is_empty() {
            fields.push(ERROR_FIELD.into());
        }
        fields
    }
}

impl WorkflowState for ReviewState {
    type Update = ReviewUpdate;

    fn apply(&mut self, update: ReviewUpdate) {
        for record in update.reviews {
            self.reviews.insert(record.participant.clone(), record);
        }
        if let Some(report) = update.report {
            self.report = Some(report);
        }
        self.errors.extend(update.errors);
    }

    fn view(&self, reads: &[String]) -> Self {
        let mut view = Self::default();
        if wants(reads, "document") {
            view.document = self.document.clone();
        }
        if wants(reads, "document_path") {
            view.document_path = self.document_path.clone();
        }
        if wants(reads, "reviews") {
            view.reviews = self.reviews.clone();
        }
        if wants(reads, "report") {
            view.report = self.report.clone();
        }
        if wants(reads, ERROR_FIELD) {
            view.errors = self.errors.clone();
        }
        view
    }

    fn record_failure(&mut self, failure: NodeFailure) {
        self.errors.push(failure);
    }
}

/// A panel of analysts reviewing one document.
pub struct ReviewPanel {
    analysts: Vec<Arc<dyn Analyst>>,
    mode: ReviewMode,
    executor: ExecutorConfig,
}

impl ReviewPanel {
    pub fn new(mode: ReviewMode) -> Self {
        Self {
            analysts: Vec::new(),
            mode,
            executor: ExecutorConfig::default(),
        }
    }

    /// Build the panel described by `[review]`, one LLM analyst per participant.
    pub fn from_config(config: &AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let mut panel = Self::new(config.review.mode)
            .with_executor(ExecutorConfig::from(&config.workflow));

        for participant in &config.review.participants {
            let (client, model): (Arc<dyn LlmClient>, _) = match &participant.model {
                Some(model) => (Arc::from(redline_llm::create_client(model)), model.clone()),
                None => (llm.clone(), config.model.clone()),
            };
            let prompt = participant
                .prompt
                .clone()
                .unwrap_or_else(|| LlmAnalyst::default_prompt(&participant.name));
            panel = panel.with_analyst(Arc::new(LlmAnalyst::new(
                participant.name.clone(),
                client,
                model,
                prompt,
            )));
        }
        panel
    }

    pub fn with_analyst(mut self, analyst: Arc<dyn Analyst>) -> Self {
        self.analysts.push(analyst);
        self
    }

    pub fn with_executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Participant names in registered order.
    pub fn participants(&self) -> Vec<String> {
        self.analysts.iter().map(|a| a.name().to_string()).collect()
    }

    /// Build the review graph: analysts first, then the aggregator.
    pub fn build_graph(&self) -> Result<Graph<ReviewState>> {
        if self.analysts.is_empty() {
            return Err(RedlineError::EmptyAggregation);
        }

        let order = self.participants();
        let mut graph = Graph::new();

        for analyst in &self.analysts {
            graph.add_node(analyst_node(analyst.clone()));
        }
        graph.add_node(aggregator_node(order.clone()));

        match self.mode {
            ReviewMode::Parallel => {
                for name in &order {
                    graph.set_entry_point(name.clone());
                }
                graph.add_join(order.clone(), AGGREGATE_NODE);
            }
            ReviewMode::Sequential => {
                graph.set_entry_point(order[0].clone());
                for pair in order.windows(2) {
                    graph.add_edge(pair[0].clone(), pair[1].clone());
                }
                if let Some(last) = order.last() {
                    graph.add_edge(last.clone(), AGGREGATE_NODE);
                }
            }
        }

        Ok(graph)
    }

    /// Review a document. The aggregator always runs, even when analysts
    /// fail; the run only errors when no analyst produced a usable record.
    pub async fn review(
        &self,
        document: impl Into<String>,
        path: Option<String>,
    ) -> Result<ExecutionResult<ReviewState>> {
        let graph = self.build_graph()?;

        let mut initial = ReviewState::new(document);
        initial.document_path = path;

        info!(participants = ?self.participants(), mode = ?self.mode, "Starting review");

        // Analyst failures must not block the aggregator.
        let executor = GraphExecutor::new(self.executor.clone().with_on_error(ErrorPolicy::Continue));
        let result = executor.run(&graph, initial).await?;

        if let Some(report) = &result.state.report {
            info!(
                severity = %report.overall_severity,
                findings = report.findings.len(),
                failed = report.failed_participants.len(),
                "Review complete"
            );
        }

        Ok(result)
    }
}

fn analyst_node(analyst: Arc<dyn Analyst>) -> Node<ReviewState> {
    let name = analyst.name().to_string();
    let field = format!("reviews.{}", name);

    Node::new(name, move |state: ReviewState| {
        let analyst = analyst.clone();
        async move {
            let participant = analyst.name().to_string();
            let mut update = ReviewUpdate::default();
            match analyst.analyze(state.document).await {
                Ok(analysis) => {
                    update
                        .reviews
                        .push(AggregationRecord::from_analysis(participant, analysis));
                }
                Err(e) => {
                    warn!(participant = %participant, error = %e, "Analyst failed");
                    update.errors.push(NodeFailure::new(participant.clone(), &e));
                    update
                        .reviews
                        .push(AggregationRecord::failed(participant, e.to_string()));
                }
            }
            Ok(update)
        }
    })
    .with_reads(["document"])
    .with_writes([field])
}

fn aggregator_node(order: Vec<String>) -> Node<ReviewState> {
    Node::new(AGGREGATE_NODE, move |state: ReviewState| {
        let order = order.clone();
        async move {
            let mut records = state.reviews;
            // A participant that timed out or panicked still gets a record.
            for name in &order {
                records
                    .entry(name.clone())
                    .or_insert_with(|| AggregationRecord::failed(name.clone(), "no result recorded"));
            }

            let mut report = aggregate(&order, &records)?;
            report.document = state.document_path;
            Ok(ReviewUpdate {
                report: Some(report),
                ..Default::default()
            })
        }
    })
    .with_reads(["document_path", "reviews"])
    .with_writes(["report"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use redline_core::types::{Analysis, Severity};

    struct Fixed(&'static str, Option<Severity>);

    impl Analyst for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn analyze(&self, _document: String) -> BoxFuture<'_, Result<Analysis>> {
            Box::pin(async move {
                match self.1 {
                    Some(sev) => Ok(Analysis::new(sev).with_findings(vec![format!("{} finding", self.0)])),
                    None => Err(RedlineError::capability(self.0, "HTTP 503")),
                }
            })
        }
    }

    fn panel(mode: ReviewMode, analysts: Vec<Fixed>) -> ReviewPanel {
        analysts
            .into_iter()
            .fold(ReviewPanel::new(mode), |p, a| p.with_analyst(Arc::new(a)))
    }

    #[tokio::test]
    async fn test_parallel_review() {
        let p = panel(
            ReviewMode::Parallel,
            vec![Fixed("security", Some(Severity::High)), Fixed("aws", Some(Severity::Medium))],
        );
        let result = p.review("doc", Some("design.md".into())).await.unwrap();
        let report = result.state.report.as_ref().unwrap();
        assert_eq!(report.overall_severity, Severity::High);
        assert_eq!(report.findings, vec!["[security] security finding", "[aws] aws finding"]);
        assert_eq!(report.document.as_deref(), Some("design.md"));
        assert_eq!(result.visits(AGGREGATE_NODE), 1);
    }

    #[tokio::test]
    async fn test_sequential_review_chains() {
        let p = panel(
            ReviewMode::Sequential,
            vec![Fixed("a", Some(Severity::Low)), Fixed("b", Some(Severity::Low))],
        );
        let result = p.review("doc", None).await.unwrap();
        let steps: Vec<_> = result.runs.iter().map(|r| (r.node.as_str(), r.step)).collect();
        assert_eq!(steps, vec![("a", 1), ("b", 2), (AGGREGATE_NODE, 3)]);
        assert_eq!(result.state.report.unwrap().overall_severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_failed_analyst_gets_failure_record() {
        let p = panel(
            ReviewMode::Parallel,
            vec![Fixed("security", None), Fixed("aws", Some(Severity::Low))],
        );
        let result = p.review("doc", None).await.unwrap();
        let report = result.state.report.unwrap();
        assert_eq!(report.failed_participants, vec!["security"]);
        assert_eq!(report.overall_severity, Severity::Low);
        assert_eq!(result.state.errors.len(), 1);
        assert_eq!(result.state.errors[0].node, "security");
    }

    #[tokio::test]
    async fn test_all_failed_is_empty_aggregation() {
        let p = panel(ReviewMode::Parallel, vec![Fixed("security", None)]);
        assert!(matches!(p.review("doc", None).await, Err(RedlineError::EmptyAggregation)));
    }

    #[tokio::test]
    async fn test_no_analysts() {
        let p = ReviewPanel::new(ReviewMode::Parallel);
        assert!(matches!(p.review("doc", None).await, Err(RedlineError::EmptyAggregation)));
    }

    #[test]
    fn test_view_restricted() {
        let mut state = ReviewState::new("doc").with_path("p.md");
        state
            .reviews
            .insert("a".into(), AggregationRecord::failed("a", "x"));
        let view = state.view(&["document".to_string()]);
        assert_eq!(view.document, "doc");
        assert!(view.reviews.is_empty());
        assert!(view.document_path.is_none());
    }
}
